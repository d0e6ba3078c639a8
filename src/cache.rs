//! Frame cache: admission, eviction, and the two-stage load pipeline
//!
//! **Why**: Smooth playback of large sequences needs the next frames
//! decoded and uploaded before they are displayed, without ever blocking
//! the caller's per-cycle path and without holding more than the requested
//! window in memory.
//!
//! **Used by**: ImagePlayer (per-cycle sync), which owns scan/rescan logic
//!
//! # Pipeline
//!
//! Admission transitions an entry to Reading and queues an IO task; the IO
//! completion transitions to Decoding and queues the upload task on the
//! single-context upload scheduler; the upload completion stores the device
//! texture and transitions to Resident. Each stage checks the generation
//! tag and the wanted flag before committing its result, so rescans and
//! window shifts discard stale work on arrival ("soft cancellation") and
//! always route buffers back to the pool. A panic inside a stage (a buggy
//! device, a decoder bug) is caught there and recorded as that frame's
//! failure, so the entry still reaches a terminal state and the in-flight
//! count still settles.
//!
//! # Locking
//!
//! One mutex serializes every entry mutation: the controller cycle and both
//! completion paths take it. Reads, decodes, and uploads run outside the
//! lock. A condvar on the same state lets `drain()` wait for in-flight work.

use log::{debug, warn};
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device::{DecodedImage, TextureDevice, TextureHandle};
use crate::frame::{FrameEntry, FrameError, FrameState, Wanted};
use crate::pool::{BufferPool, PooledBuf};
use crate::scheduler::TaskScheduler;

/// Entry table plus the bookkeeping shared with completion callbacks.
#[derive(Debug)]
struct CacheInner {
    entries: Vec<FrameEntry>,
    /// Bumped on every rebuild; tasks tagged with an older value discard
    /// their results on arrival.
    generation: u64,
    /// Scheduled loads that have not reached a terminal transition yet.
    in_flight: usize,
}

/// Per-cycle result of [`FrameCache::sync`].
#[derive(Debug)]
pub struct SyncOutput {
    /// Resident texture per requested visible index (None = not yet loaded).
    pub textures: Vec<Option<TextureHandle>>,
    /// Loaded flag per requested visible index.
    pub loaded: Vec<bool>,
    /// Wall time spent inside IO tasks since the previous cycle.
    pub io_duration: Duration,
    /// Wall time spent inside decode/upload tasks since the previous cycle.
    pub upload_duration: Duration,
    /// Resident or in-flight frames that fell outside the wanted set this
    /// cycle (evicted or marked for discard).
    pub unused_frames: usize,
}

/// Sliding working-set cache over one scanned frame list.
pub struct FrameCache {
    inner: Arc<(Mutex<CacheInner>, Condvar)>,
    buffers: Arc<BufferPool>,
    io: Arc<TaskScheduler>,
    upload: Arc<TaskScheduler>,
    device: Arc<dyn TextureDevice>,
    io_nanos: Arc<AtomicU64>,
    upload_nanos: Arc<AtomicU64>,
}

impl FrameCache {
    pub fn new(
        buffers: Arc<BufferPool>,
        io: Arc<TaskScheduler>,
        upload: Arc<TaskScheduler>,
        device: Arc<dyn TextureDevice>,
    ) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(CacheInner {
                    entries: Vec::new(),
                    generation: 0,
                    in_flight: 0,
                }),
                Condvar::new(),
            )),
            buffers,
            io,
            upload,
            device,
            io_nanos: Arc::new(AtomicU64::new(0)),
            upload_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the frame list with a fresh scan result.
    ///
    /// Starts a new generation: every in-flight load becomes stale.
    /// Resident textures survive only for paths unchanged at the same
    /// index; everything else is released and reloads cold.
    pub fn rebuild(&self, paths: impl Iterator<Item = PathBuf>) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(|e| e.into_inner());

        inner.generation += 1;
        let generation = inner.generation;
        let mut old = std::mem::take(&mut inner.entries);

        let mut kept = 0usize;
        let mut entries: Vec<FrameEntry> = Vec::new();
        for (index, path) in paths.enumerate() {
            let mut entry = FrameEntry::new(index, path);
            if let Some(prev) = old.get_mut(index)
                && prev.state == FrameState::Resident
                && prev.path == entry.path
            {
                entry.texture = prev.texture.take();
                entry.state = FrameState::Resident;
                kept += 1;
            }
            entries.push(entry);
        }

        // Everything not carried over gets torn down now; in-flight tasks
        // that already checked their buffer out return it themselves when
        // they see the stale generation.
        for mut prev in old.drain(..) {
            if let Some(texture) = prev.texture.take() {
                self.device.release(texture);
            }
            if let Some(buffer) = prev.buffer.take() {
                self.buffers.release(buffer);
            }
        }

        debug!(
            "Cache rebuild: generation {}, {} frames ({} kept resident)",
            generation,
            entries.len(),
            kept
        );
        inner.entries = entries;
    }

    /// One evaluation cycle: diff wanted-vs-resident, admit, evict.
    ///
    /// Never blocks; anything still in flight is reported as not loaded.
    /// Visible entries are scheduled ahead of preload entries, so under
    /// scheduler capacity pressure the visible window wins admission.
    pub fn sync(&self, visible: &[usize], preload: &[usize], buffer_size: usize) -> SyncOutput {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(|e| e.into_inner());
        let generation = inner.generation;

        for entry in &mut inner.entries {
            entry.wanted = Wanted::No;
        }
        for &index in visible {
            if let Some(entry) = inner.entries.get_mut(index) {
                entry.wanted = Wanted::Visible;
            }
        }
        for &index in preload {
            if let Some(entry) = inner.entries.get_mut(index)
                && entry.wanted == Wanted::No
            {
                entry.wanted = Wanted::Preload;
            }
        }

        // Diagnostic first: how much was held that the windows no longer want
        let unused_frames = inner
            .entries
            .iter()
            .filter(|e| e.wanted == Wanted::No && (e.is_resident() || e.is_in_flight()))
            .count();

        // Evict resident frames outside the windows; in-flight ones are only
        // marked (wanted == No) and discard their results on completion
        for entry in &mut inner.entries {
            if entry.wanted == Wanted::No && entry.state == FrameState::Resident {
                if let Some(texture) = entry.texture.take() {
                    self.device.release(texture);
                }
                entry.state = FrameState::Unloaded;
            }
        }

        // Admission: visible before preload (FIFO workers make this the
        // priority order under capacity pressure)
        for &index in visible.iter().chain(preload.iter()) {
            let Some(entry) = inner.entries.get_mut(index) else {
                continue;
            };
            if entry.state != FrameState::Unloaded {
                continue;
            }
            entry.state = FrameState::Reading;
            entry.last_error = None;
            entry.buffer = Some(self.buffers.acquire(buffer_size.max(1)));
            inner.in_flight += 1;
            self.schedule_read(index, generation);
        }

        let textures: Vec<Option<TextureHandle>> = visible
            .iter()
            .map(|&index| {
                inner
                    .entries
                    .get(index)
                    .filter(|e| e.is_resident())
                    .and_then(|e| e.texture)
            })
            .collect();
        let loaded: Vec<bool> = textures.iter().map(|t| t.is_some()).collect();

        SyncOutput {
            textures,
            loaded,
            io_duration: Duration::from_nanos(self.io_nanos.swap(0, Ordering::Relaxed)),
            upload_duration: Duration::from_nanos(self.upload_nanos.swap(0, Ordering::Relaxed)),
            unused_frames,
        }
    }

    fn schedule_read(&self, index: usize, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let buffers = Arc::clone(&self.buffers);
        let upload = Arc::clone(&self.upload);
        let device = Arc::clone(&self.device);
        let io_nanos = Arc::clone(&self.io_nanos);
        let upload_nanos = Arc::clone(&self.upload_nanos);

        self.io.schedule(move || {
            let started = Instant::now();

            // Check out the buffer; bail if a rescan or window shift got
            // here first
            let (path, mut buf) = {
                let (lock, cvar) = &*inner;
                let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
                if state.generation != generation {
                    finish_one(&mut state, cvar);
                    return;
                }
                let entry = &mut state.entries[index];
                if entry.wanted == Wanted::No {
                    if let Some(buf) = entry.buffer.take() {
                        buffers.release(buf);
                    }
                    entry.state = FrameState::Unloaded;
                    finish_one(&mut state, cvar);
                    return;
                }
                let Some(buf) = entry.buffer.take() else {
                    warn!("Read task for frame {} found no buffer", index);
                    finish_one(&mut state, cvar);
                    return;
                };
                (entry.path.clone(), buf)
            };

            let result = match catch_unwind(AssertUnwindSafe(|| read_file(&path, &mut buf))) {
                Ok(result) => result.map_err(|e| FrameError::Read(e.to_string())),
                Err(payload) => Err(FrameError::Read(panic_message(payload.as_ref()))),
            };
            io_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

            let (lock, cvar) = &*inner;
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                buffers.release(buf);
                finish_one(&mut state, cvar);
                return;
            }
            let entry = &mut state.entries[index];
            if entry.wanted == Wanted::No {
                // Soft-cancelled while reading; drop the result
                buffers.release(buf);
                entry.state = FrameState::Unloaded;
                finish_one(&mut state, cvar);
                return;
            }
            match result {
                Ok(()) => {
                    entry.state = FrameState::Decoding;
                    entry.buffer = Some(buf);
                    let inner = Arc::clone(&inner);
                    let buffers = Arc::clone(&buffers);
                    let device = Arc::clone(&device);
                    let upload_nanos = Arc::clone(&upload_nanos);
                    upload.schedule(move || {
                        run_upload(inner, buffers, device, upload_nanos, index, generation);
                    });
                    // in_flight carries over to the upload task
                }
                Err(e) => {
                    warn!("Read failed for {}: {}", path.display(), e);
                    buffers.release(buf);
                    entry.state = FrameState::Failed;
                    entry.last_error = Some(e);
                    finish_one(&mut state, cvar);
                }
            }
        });
    }

    /// Block until no scheduled load remains in flight.
    pub fn drain(&self) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(|e| e.into_inner());
        while inner.in_flight > 0 {
            inner = cvar.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Release every texture and pooled buffer (shutdown path).
    ///
    /// Call only after `drain()`; in-flight tasks may otherwise still
    /// install results.
    pub fn release_all(&self) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(|e| e.into_inner());
        for entry in &mut inner.entries {
            if let Some(texture) = entry.texture.take() {
                self.device.release(texture);
            }
            if let Some(buffer) = entry.buffer.take() {
                self.buffers.release(buffer);
            }
            entry.state = FrameState::Unloaded;
        }
    }

    pub fn frame_count(&self) -> usize {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn generation(&self) -> u64 {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Snapshot of one entry's state (diagnostics and tests).
    pub fn state_of(&self, index: usize) -> Option<FrameState> {
        let (lock, _) = &*self.inner;
        let inner = lock.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(index).map(|e| e.state)
    }

    pub fn resident_count(&self) -> usize {
        let (lock, _) = &*self.inner;
        let inner = lock.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.iter().filter(|e| e.is_resident()).count()
    }
}

/// Decode + upload stage, running on the single-context upload scheduler.
fn run_upload(
    inner: Arc<(Mutex<CacheInner>, Condvar)>,
    buffers: Arc<BufferPool>,
    device: Arc<dyn TextureDevice>,
    upload_nanos: Arc<AtomicU64>,
    index: usize,
    generation: u64,
) {
    let started = Instant::now();

    // Check the buffer out of the entry for the decode
    let buf = {
        let (lock, cvar) = &*inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            finish_one(&mut state, cvar);
            return;
        }
        let entry = &mut state.entries[index];
        if entry.wanted == Wanted::No {
            if let Some(buf) = entry.buffer.take() {
                buffers.release(buf);
            }
            entry.state = FrameState::Unloaded;
            finish_one(&mut state, cvar);
            return;
        }
        let Some(buf) = entry.buffer.take() else {
            warn!("Upload task for frame {} found no buffer", index);
            finish_one(&mut state, cvar);
            return;
        };
        buf
    };

    let result = match catch_unwind(AssertUnwindSafe(|| {
        decode(buf.bytes()).and_then(|image| device.upload(&image).map_err(FrameError::Upload))
    })) {
        Ok(result) => result,
        Err(payload) => Err(FrameError::Upload(panic_message(payload.as_ref()))),
    };
    upload_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

    let (lock, cvar) = &*inner;
    let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
    buffers.release(buf);

    if state.generation != generation {
        // Stale result: the texture was uploaded for a superseded scan
        if let Ok(texture) = result {
            device.release(texture);
        }
        finish_one(&mut state, cvar);
        return;
    }
    let entry = &mut state.entries[index];
    if entry.wanted == Wanted::No {
        if let Ok(texture) = result {
            device.release(texture);
        }
        entry.state = FrameState::Unloaded;
        finish_one(&mut state, cvar);
        return;
    }
    match result {
        Ok(texture) => {
            entry.texture = Some(texture);
            entry.state = FrameState::Resident;
        }
        Err(e) => {
            warn!("Decode/upload failed for {}: {}", entry.path.display(), e);
            entry.state = FrameState::Failed;
            entry.last_error = Some(e);
        }
    }
    finish_one(&mut state, cvar);
}

/// Terminal transition bookkeeping shared by every completion path.
fn finish_one(state: &mut CacheInner, cvar: &Condvar) {
    state.in_flight = state.in_flight.saturating_sub(1);
    cvar.notify_all();
}

/// Best-effort text from a caught panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

fn read_file(path: &std::path::Path, buf: &mut PooledBuf) -> std::io::Result<()> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    let bytes = buf.bytes_mut();
    bytes.clear();
    bytes.reserve(len);
    file.read_to_end(bytes)?;
    Ok(())
}

fn decode(bytes: &[u8]) -> Result<DecodedImage, FrameError> {
    let image = image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
    let rgba = image.to_rgba8();
    Ok(DecodedImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}
