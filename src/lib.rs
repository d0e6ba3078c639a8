//! framestream - streaming image-sequence frame cache
//!
//! Streams a numbered sequence of image files from disk into displayable
//! frames, keeping only the requested visible+preload window resident.
//! Disk reads run on a bounded IO worker pool; decode and upload run on a
//! single-context worker so the display device is never touched from more
//! than one thread. Buffers are pooled to keep allocation out of the
//! per-frame path.

pub mod cache;
pub mod device;
pub mod frame;
pub mod player;
pub mod pool;
pub mod scan;
pub mod scheduler;

pub use cache::{FrameCache, SyncOutput};
pub use device::{DecodedImage, NullDevice, TextureDevice, TextureHandle};
pub use frame::{FrameEntry, FrameError, FrameState};
pub use player::{
    CycleInput, CycleOutput, ImagePlayer, PlayerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_FILEMASK,
};
pub use pool::{BufferPool, ObjectPool, PooledBuf};
pub use scheduler::{TaskHandle, TaskScheduler, Workers};
