//! Frame entries and their lifecycle states
//!
//! One `FrameEntry` per file in the scanned sequence. State moves strictly
//! Unloaded -> Reading -> Decoding -> Resident (or Failed at any step);
//! eviction puts an entry back to Unloaded. All transitions happen under
//! the cache lock, written only by the controller cycle and the scheduler
//! completion paths.

use std::path::PathBuf;

use crate::device::TextureHandle;
use crate::pool::PooledBuf;

/// Lifecycle state of one frame in the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Not resident and no work in flight.
    Unloaded,
    /// An IO task owns the disk read.
    Reading,
    /// The read finished; an upload task owns decode + device upload.
    Decoding,
    /// Decoded and uploaded; `texture` holds the displayable resource.
    Resident,
    /// Read or decode failed; not retried until the next rescan.
    Failed,
}

/// Which window requested this frame in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wanted {
    No,
    Preload,
    Visible,
}

/// Per-frame load errors. Failures stay on the entry; they never abort the
/// cache or affect other frames.
#[derive(Debug, Clone)]
pub enum FrameError {
    /// Directory missing/unreadable or bad filemask; the scan yields an
    /// empty frame list.
    Enumeration(String),
    /// Individual file unreadable.
    Read(String),
    /// Corrupt or unsupported image data.
    Decode(String),
    /// The device rejected the decoded frame.
    Upload(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Enumeration(e) => write!(f, "Enumeration error: {}", e),
            FrameError::Read(e) => write!(f, "Read error: {}", e),
            FrameError::Decode(e) => write!(f, "Decode error: {}", e),
            FrameError::Upload(e) => write!(f, "Upload error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// One file of the sequence and everything the cache knows about it.
///
/// Holds at most one of {`buffer`, `texture`}: the pooled read buffer while
/// Reading/Decoding, the device texture while Resident. The buffer sits in
/// the entry between pipeline stages and is checked out by the active
/// worker, so the handoff window where both are absent is transient.
#[derive(Debug)]
pub struct FrameEntry {
    pub index: usize,
    pub path: PathBuf,
    pub state: FrameState,
    pub(crate) buffer: Option<PooledBuf>,
    pub(crate) texture: Option<TextureHandle>,
    pub(crate) wanted: Wanted,
    pub last_error: Option<FrameError>,
}

impl FrameEntry {
    pub fn new(index: usize, path: PathBuf) -> Self {
        Self {
            index,
            path,
            state: FrameState::Unloaded,
            buffer: None,
            texture: None,
            wanted: Wanted::No,
            last_error: None,
        }
    }

    /// Reading or Decoding: a scheduled task will eventually report back.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, FrameState::Reading | FrameState::Decoding)
    }

    pub fn is_resident(&self) -> bool {
        self.state == FrameState::Resident
    }
}
