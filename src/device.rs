//! Opaque display-device boundary
//!
//! The cache never creates or destroys GPU resources itself; it hands
//! decoded pixels to a [`TextureDevice`] and gets back an opaque handle.
//! `upload` is always invoked from the cache's single upload worker.
//! `release` may be called from the controller thread or a worker, so
//! implementations must tolerate release from any thread.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Decoded RGBA8 pixels ready for upload.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Opaque handle to a displayable resource owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

impl TextureHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Decoded bytes in, displayable resource out.
pub trait TextureDevice: Send + Sync {
    fn upload(&self, image: &DecodedImage) -> Result<TextureHandle, String>;
    fn release(&self, handle: TextureHandle);
}

/// Counting stub device for tests and the demo binary.
#[derive(Debug, Default)]
pub struct NullDevice {
    next_id: AtomicU64,
    live: AtomicUsize,
    uploads: AtomicUsize,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Textures uploaded and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Total uploads since creation.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }
}

impl TextureDevice for NullDevice {
    fn upload(&self, _image: &DecodedImage) -> Result<TextureHandle, String> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(TextureHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn release(&self, _handle: TextureHandle) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}
