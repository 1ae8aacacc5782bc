//! Fixed-slab buffer pool.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A byte buffer lent out by a [`BufferPool`].
///
/// The slab is zero-initialized at its full capacity so it can serve
/// directly as a read target. Ownership is exclusive until the buffer is
/// handed back to the pool.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
}

impl PooledBuf {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
        }
    }

    /// Usable size of the slab in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole slab as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Pool of reusable byte buffers.
///
/// Buffers are multiples of the configured default size. Returned buffers
/// are kept on an idle list up to `max_idle`; everything beyond that is
/// dropped so a burst of large sessions does not pin memory forever.
#[derive(Debug)]
pub struct BufferPool {
    default_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<PooledBuf>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `default_size` bytes.
    pub fn new(default_size: usize, max_idle: usize) -> Self {
        assert!(default_size > 0, "buffer size must be non-zero");
        Self {
            default_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Borrow a buffer of the default size.
    pub fn borrow(&self) -> PooledBuf {
        self.borrow_at_least(self.default_size)
    }

    /// Borrow a buffer with at least `min` bytes of capacity.
    ///
    /// The capacity is rounded up to the next multiple of the default size
    /// so returned buffers stay interchangeable.
    pub fn borrow_at_least(&self, min: usize) -> PooledBuf {
        let want = self.rounded(min);
        let reused = {
            let mut idle = self.idle.lock();
            idle.iter()
                .position(|buf| buf.capacity() >= want)
                .map(|pos| idle.swap_remove(pos))
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        reused.unwrap_or_else(|| PooledBuf::with_capacity(want))
    }

    /// Return a buffer to the pool.
    pub fn give_back(&self, buf: PooledBuf) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// Number of buffers currently lent out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of buffers parked on the idle list.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// The configured default buffer size.
    pub fn default_size(&self) -> usize {
        self.default_size
    }

    fn rounded(&self, min: usize) -> usize {
        let slabs = min.div_ceil(self.default_size).max(1);
        slabs * self.default_size
    }
}
