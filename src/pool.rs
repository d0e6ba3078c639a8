//! Reusable buffer and object pools for the load pipeline
//!
//! **Why**: Streaming a sequence at playback rate means one large disk read
//! per frame. Recycling the byte buffers (and auxiliary scratch objects)
//! keeps allocation churn out of the hot path.
//!
//! **Used by**: FrameCache (IO read buffers), ImagePlayer (rescan scratch)
//!
//! # Ownership
//!
//! A [`PooledBuf`] is a move-only handle. `release()` consumes it, so a
//! released buffer cannot be touched afterwards. Releasing a buffer into a
//! pool that did not create it is a programming error and panics.
//!
//! # Backpressure
//!
//! Neither pool bounds the number of outstanding items. The scheduler's
//! worker cap limits how many buffers can be in flight at once.

use log::debug;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Smallest size class handed out by [`BufferPool`].
const MIN_CLASS: usize = 4096;

/// Unique id per pool instance, used to catch cross-pool release.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Byte buffer checked out of a [`BufferPool`].
///
/// Starts empty with capacity at least the requested size. The underlying
/// `Vec` may grow during a read; the pool re-buckets it by its final
/// capacity on release.
#[derive(Debug)]
pub struct PooledBuf {
    bytes: Vec<u8>,
    pool_id: u64,
}

impl PooledBuf {
    /// Filled contents (empty until a read populates the buffer).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access for the IO worker filling the buffer.
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

/// Size-class bucketed recycler for file read buffers.
///
/// Concurrent `acquire`/`release` from multiple IO workers is safe; all
/// state sits behind one mutex (acquire/release are rare next to the reads
/// they serve).
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    buckets: Mutex<BTreeMap<usize, Vec<Vec<u8>>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            buckets: Mutex::new(BTreeMap::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Check out a buffer with capacity >= `min_size`.
    ///
    /// Reuses the smallest pooled buffer whose size class fits, otherwise
    /// allocates a fresh one rounded up to the next power-of-two class.
    pub fn acquire(&self, min_size: usize) -> PooledBuf {
        let class = size_class(min_size);

        let recycled = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let found = buckets
                .range_mut(class..)
                .find(|(_, bufs)| !bufs.is_empty())
                .and_then(|(_, bufs)| bufs.pop());
            found
        };

        let bytes = match recycled {
            Some(mut bytes) => {
                bytes.clear();
                bytes
            }
            None => {
                debug!("BufferPool: allocating new {} byte buffer", class);
                Vec::with_capacity(class)
            }
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            bytes,
            pool_id: self.id,
        }
    }

    /// Return a buffer for reuse.
    ///
    /// # Panics
    ///
    /// Panics if `buf` was acquired from a different pool. That is undefined
    /// ownership and must fail loudly rather than corrupt accounting.
    pub fn release(&self, mut buf: PooledBuf) {
        if buf.pool_id != self.id {
            panic!(
                "BufferPool misuse: buffer from pool {} released into pool {}",
                buf.pool_id, self.id
            );
        }

        buf.bytes.clear();
        let class = size_class(buf.bytes.capacity());
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.entry(class).or_default().push(buf.bytes);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Buffers currently checked out (acquired and not yet released).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers currently resting in the pool.
    pub fn pooled(&self) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.values().map(|bufs| bufs.len()).sum()
    }

    /// Free all pooled memory. Outstanding buffers are unaffected.
    pub fn clear(&self) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let count: usize = buckets.values().map(|bufs| bufs.len()).sum();
        buckets.clear();
        if count > 0 {
            debug!("BufferPool: dropped {} pooled buffers", count);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn size_class(size: usize) -> usize {
    size.next_power_of_two().max(MIN_CLASS)
}

/// Generic recycler for auxiliary reusable objects.
///
/// `acquire` constructs via the factory when the pool is empty, so callers
/// never observe an empty pool. `take_all_and_clear` drains everything for
/// deterministic disposal at shutdown.
pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            items: Mutex::new(Vec::new()),
            factory: Box::new(factory),
        }
    }

    pub fn acquire(&self) -> T {
        let recycled = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.pop()
        };
        recycled.unwrap_or_else(|| (self.factory)())
    }

    pub fn release(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push(item);
    }

    /// Drain every pooled instance (shutdown path).
    pub fn take_all_and_clear(&self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *items)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_meets_min_size() {
        let pool = BufferPool::new();
        let buf = pool.acquire(100_000);
        assert!(buf.capacity() >= 100_000);
        assert!(buf.bytes().is_empty());
        pool.release(buf);
    }

    #[test]
    fn test_buffer_reuse() {
        let pool = BufferPool::new();
        let buf = pool.acquire(8192);
        let cap = buf.capacity();
        pool.release(buf);

        // Same class request gets the pooled buffer back, no new allocation
        let buf2 = pool.acquire(8192);
        assert_eq!(buf2.capacity(), cap);
        assert_eq!(pool.pooled(), 0);
        pool.release(buf2);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_outstanding_accounting() {
        let pool = BufferPool::new();
        assert_eq!(pool.outstanding(), 0);

        let a = pool.acquire(4096);
        let b = pool.acquire(4096);
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    #[should_panic(expected = "BufferPool misuse")]
    fn test_cross_pool_release_panics() {
        let pool_a = BufferPool::new();
        let pool_b = BufferPool::new();
        let buf = pool_a.acquire(4096);
        pool_b.release(buf);
    }

    #[test]
    fn test_grown_buffer_rebuckets() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(4096);
        // Simulate a read that outgrew the original class
        buf.bytes_mut().resize(20_000, 0);
        pool.release(buf);

        let buf = pool.acquire(20_000);
        assert!(buf.capacity() >= 20_000);
        pool.release(buf);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let buf = pool.acquire(16384);
                    pool.release(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_object_pool_factory_and_reuse() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(|| Vec::with_capacity(64));

        let mut v = pool.acquire();
        assert_eq!(v.capacity(), 64);
        v.reserve(1024);
        let cap = v.capacity();
        pool.release(v);

        // Reuse keeps the grown capacity
        let v = pool.acquire();
        assert_eq!(v.capacity(), cap);
        pool.release(v);
    }

    #[test]
    fn test_object_pool_drain() {
        let pool: ObjectPool<String> = ObjectPool::new(String::new);
        pool.release("a".to_string());
        pool.release("b".to_string());
        assert_eq!(pool.len(), 2);

        let drained = pool.take_all_and_clear();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
    }
}
