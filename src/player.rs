//! Per-instance streaming controller
//!
//! **Why**: The host evaluates once per tick with fresh parameters; the
//! player turns that into rescans and cache syncs without ever blocking
//! the tick. One instance per parallel slot.
//!
//! **Used by**: Host render loop (one `evaluate` per logical time step)
//!
//! # Generations
//!
//! Idle -> Scanning -> Streaming. A directory, filemask, or explicit
//! reload change re-enters Scanning: the file list is re-enumerated,
//! sorted, and rebuilt under a new generation. Worker counts are fixed for
//! the instance's lifetime; the host compares `config()` against its
//! wanted counts and recreates the instance on mismatch, which is the only
//! way to resize the schedulers.

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FrameCache;
use crate::device::{TextureDevice, TextureHandle};
use crate::frame::FrameError;
use crate::pool::{BufferPool, ObjectPool};
use crate::scan;
use crate::scheduler::{TaskScheduler, Workers};

/// Filemask used when the host supplies none.
pub const DEFAULT_FILEMASK: &str = "*.*";

/// Read buffer size hint used when the host supplies zero.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Scheduler sizing, immutable for the instance's lifetime.
///
/// Hosts holding raw thread counts map them with [`Workers::from_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerConfig {
    /// Concurrent disk reads. `Workers::Unbounded` removes the cap.
    pub io_workers: Workers,
    /// Retained for teardown detection only; the upload side always runs
    /// one worker because the device is bound to a single context.
    pub upload_workers: Workers,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            io_workers: Workers::Bounded(1),
            upload_workers: Workers::Bounded(2),
        }
    }
}

/// Everything the host supplies for one evaluation cycle.
#[derive(Debug, Clone)]
pub struct CycleInput<'a> {
    pub directories: &'a [PathBuf],
    pub filemasks: &'a [String],
    /// IO buffer size hint in bytes (0 falls back to the default).
    pub buffer_size: usize,
    /// Indices that must become resident for display.
    pub visible: &'a [usize],
    /// Indices to load opportunistically.
    pub preload: &'a [usize],
    /// Force a rescan even if directories and filemasks are unchanged.
    pub reload: bool,
}

/// Everything reported back for one evaluation cycle.
#[derive(Debug)]
pub struct CycleOutput {
    /// One slot per visible index; None until the frame is resident.
    pub textures: Vec<Option<TextureHandle>>,
    /// Loaded flag per visible index (false for failed frames too).
    pub loaded: Vec<bool>,
    pub io_duration: Duration,
    pub upload_duration: Duration,
    /// Frames held at cycle start that no window wanted anymore.
    pub unused_frames: usize,
    /// Entries in the current scan.
    pub frame_count: usize,
}

/// Streaming controller for one directory+filemask selection.
pub struct ImagePlayer {
    config: PlayerConfig,
    directories: Vec<PathBuf>,
    filemasks: Vec<String>,
    scanned: bool,
    last_scan_error: Option<FrameError>,
    scan_scratch: ObjectPool<Vec<PathBuf>>,
    cache: FrameCache,
    // Kept alive here; the cache holds its own handles for scheduling
    _io: Arc<TaskScheduler>,
    _upload: Arc<TaskScheduler>,
}

impl ImagePlayer {
    pub fn new(config: PlayerConfig, device: Arc<dyn TextureDevice>) -> Self {
        let io = Arc::new(TaskScheduler::new("framestream-io", config.io_workers));
        // Single context: the device may only be touched from one thread
        let upload = Arc::new(TaskScheduler::new("framestream-upload", Workers::Bounded(1)));
        let buffers = Arc::new(BufferPool::new());
        let cache = FrameCache::new(
            buffers,
            Arc::clone(&io),
            Arc::clone(&upload),
            device,
        );

        info!(
            "ImagePlayer created: io={:?}, upload={:?} (single upload context)",
            config.io_workers, config.upload_workers
        );

        Self {
            config,
            directories: Vec::new(),
            filemasks: Vec::new(),
            scanned: false,
            last_scan_error: None,
            scan_scratch: ObjectPool::new(Vec::new),
            cache,
            _io: io,
            _upload: upload,
        }
    }

    /// One evaluation cycle. Never blocks: in-flight frames come back as
    /// "not loaded" placeholders until a later cycle.
    pub fn evaluate(&mut self, input: &CycleInput) -> CycleOutput {
        let selection_changed =
            self.directories != input.directories || self.filemasks != input.filemasks;
        if !self.scanned || input.reload || selection_changed {
            self.directories = input.directories.to_vec();
            self.filemasks = input.filemasks.to_vec();
            self.rescan();
        }

        let buffer_size = if input.buffer_size > 0 {
            input.buffer_size
        } else {
            DEFAULT_BUFFER_SIZE
        };
        let sync = self.cache.sync(input.visible, input.preload, buffer_size);

        CycleOutput {
            textures: sync.textures,
            loaded: sync.loaded,
            io_duration: sync.io_duration,
            upload_duration: sync.upload_duration,
            unused_frames: sync.unused_frames,
            frame_count: self.cache.frame_count(),
        }
    }

    fn rescan(&mut self) {
        let mut paths = self.scan_scratch.acquire();

        match scan::enumerate(&self.directories, &self.filemasks, &mut paths) {
            Ok(()) => {
                self.last_scan_error = None;
            }
            Err(e) => {
                // Once per scan; the frame list stays empty
                warn!("Scan failed: {}", e);
                paths.clear();
                self.last_scan_error = Some(e);
            }
        }

        debug!("Rescan: {} frames", paths.len());
        self.cache.rebuild(paths.drain(..));
        self.scan_scratch.release(paths);
        self.scanned = true;
    }

    /// The sizing this instance was built with. A host wanting different
    /// worker counts must drop this instance and create a new one.
    pub fn config(&self) -> PlayerConfig {
        self.config
    }

    pub fn frame_count(&self) -> usize {
        self.cache.frame_count()
    }

    /// Scan generation, bumped by every rescan.
    pub fn generation(&self) -> u64 {
        self.cache.generation()
    }

    pub fn last_scan_error(&self) -> Option<&FrameError> {
        self.last_scan_error.as_ref()
    }

    /// Block until all scheduled loads have settled (tests and shutdown).
    pub fn drain(&self) {
        self.cache.drain();
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &FrameCache {
        &self.cache
    }
}

impl Drop for ImagePlayer {
    fn drop(&mut self) {
        // Let in-flight work settle before tearing resources down, so no
        // completion installs a texture after release_all
        self.cache.drain();
        self.cache.release_all();
        self.scan_scratch.take_all_and_clear();
        debug!("ImagePlayer disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;
    use crate::frame::FrameState;
    use std::fs;
    use std::path::Path;

    fn write_png(dir: &Path, name: &str) {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255]));
        if name.ends_with(".jpg") {
            // JPEG has no alpha channel; the encoder rejects Rgba8
            image::DynamicImage::ImageRgba8(img)
                .to_rgb8()
                .save(dir.join(name))
                .unwrap();
        } else {
            img.save(dir.join(name)).unwrap();
        }
    }

    fn make_player(io_workers: Workers) -> (ImagePlayer, Arc<NullDevice>) {
        let device = Arc::new(NullDevice::new());
        let player = ImagePlayer::new(
            PlayerConfig {
                io_workers,
                upload_workers: Workers::Bounded(1),
            },
            Arc::clone(&device) as Arc<dyn TextureDevice>,
        );
        (player, device)
    }

    fn input<'a>(
        dirs: &'a [PathBuf],
        masks: &'a [String],
        visible: &'a [usize],
        preload: &'a [usize],
        reload: bool,
    ) -> CycleInput<'a> {
        CycleInput {
            directories: dirs,
            filemasks: masks,
            buffer_size: 4096,
            visible,
            preload,
            reload,
        }
    }

    #[test]
    fn test_visible_and_preload_become_resident() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");
        write_png(dir.path(), "c.png");

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, _) = make_player(Workers::Bounded(2));

        let out = player.evaluate(&input(&dirs, &masks, &[0], &[1], false));
        assert_eq!(out.frame_count, 3);
        player.drain();

        // a and b resident, c untouched
        let out = player.evaluate(&input(&dirs, &masks, &[0, 1, 2], &[], false));
        assert_eq!(out.loaded, [true, true, false]);
        assert!(out.textures[0].is_some());
        assert!(out.textures[1].is_some());
        assert!(out.textures[2].is_none());
        player.drain();
    }

    #[test]
    fn test_window_shift_evicts_without_rescan() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");
        write_png(dir.path(), "c.png");

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, device) = make_player(Workers::Bounded(2));

        player.evaluate(&input(&dirs, &masks, &[0], &[], false));
        player.drain();
        let generation = player.generation();

        let out = player.evaluate(&input(&dirs, &masks, &[2], &[], false));
        assert_eq!(out.unused_frames, 1);
        player.drain();

        assert_eq!(player.generation(), generation);
        assert_eq!(player.cache().state_of(0), Some(FrameState::Unloaded));
        assert_eq!(player.cache().state_of(2), Some(FrameState::Resident));
        assert_eq!(device.live(), 1);
    }

    #[test]
    fn test_reload_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, _) = make_player(Workers::Bounded(1));

        player.evaluate(&input(&dirs, &masks, &[], &[], false));
        let g1 = player.generation();
        player.evaluate(&input(&dirs, &masks, &[], &[], false));
        assert_eq!(player.generation(), g1);

        player.evaluate(&input(&dirs, &masks, &[], &[], true));
        assert!(player.generation() > g1);
        player.drain();
    }

    #[test]
    fn test_filemask_change_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.jpg");

        let dirs = vec![dir.path().to_path_buf()];
        let (mut player, _) = make_player(Workers::Bounded(1));

        let masks = vec!["*.png".to_string()];
        let out = player.evaluate(&input(&dirs, &masks, &[], &[], false));
        assert_eq!(out.frame_count, 1);
        let g1 = player.generation();

        let masks = vec!["*.*".to_string()];
        let out = player.evaluate(&input(&dirs, &masks, &[], &[], false));
        assert_eq!(out.frame_count, 2);
        assert!(player.generation() > g1);
        player.drain();
    }

    #[test]
    fn test_enumeration_failure_is_not_fatal() {
        let dirs = vec![PathBuf::from("/no/such/dir")];
        let masks = vec!["*.png".to_string()];
        let (mut player, _) = make_player(Workers::Bounded(1));

        let out = player.evaluate(&input(&dirs, &masks, &[0], &[], false));
        assert_eq!(out.frame_count, 0);
        assert_eq!(out.loaded, [false]);
        assert!(matches!(
            player.last_scan_error(),
            Some(FrameError::Enumeration(_))
        ));

        // A later cycle with a valid directory recovers
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        let dirs = vec![dir.path().to_path_buf()];
        let out = player.evaluate(&input(&dirs, &masks, &[0], &[], false));
        assert_eq!(out.frame_count, 1);
        assert!(player.last_scan_error().is_none());
        player.drain();
    }

    #[test]
    fn test_failed_frame_reported_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        fs::write(dir.path().join("b.png"), b"garbage").unwrap();

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, _) = make_player(Workers::Bounded(2));

        player.evaluate(&input(&dirs, &masks, &[0, 1], &[], false));
        player.drain();

        let out = player.evaluate(&input(&dirs, &masks, &[0, 1], &[], false));
        assert_eq!(out.loaded, [true, false]);
        player.drain();
    }

    #[test]
    fn test_drop_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, device) = make_player(Workers::Bounded(2));

        player.evaluate(&input(&dirs, &masks, &[0, 1], &[], false));
        drop(player);

        assert_eq!(device.live(), 0);
    }

    #[test]
    fn test_config_is_immutable_per_instance() {
        let (player, _) = make_player(Workers::Bounded(3));
        assert_eq!(
            player.config(),
            PlayerConfig {
                io_workers: Workers::Bounded(3),
                upload_workers: Workers::Bounded(1)
            }
        );
    }

    #[test]
    fn test_unbounded_io_workers() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");

        let dirs = vec![dir.path().to_path_buf()];
        let masks = vec!["*.png".to_string()];
        let (mut player, device) = make_player(Workers::Unbounded);
        assert_eq!(player.config().io_workers, Workers::Unbounded);

        player.evaluate(&input(&dirs, &masks, &[0], &[1], false));
        player.drain();

        assert_eq!(device.live(), 2);
        assert_eq!(player.cache().state_of(0), Some(FrameState::Resident));
        assert_eq!(player.cache().state_of(1), Some(FrameState::Resident));
    }
}
