//! Buffer pool for recycling the `BytesMut` allocations used by frame reads.
//!
//! Every dispatched connection needs a read buffer that can grow to hold one
//! frame. Allocating it per read would put the allocator on the hot path, so
//! buffers are lent out of this pool and handed back when the read finishes.
//!
//! Backed by `crossbeam_queue::ArrayQueue` for lock-free, bounded pooling.
//! When the pool is empty, `acquire()` allocates a fresh buffer. When the pool
//! is full, `release()` drops the buffer instead of returning it.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Initial capacity of freshly allocated buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Buffers that grew past this capacity are not kept for reuse.
pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

/// A lock-free pool of `BytesMut` buffers shared by all connection workers.
///
/// # Design
///
/// - `acquire()` pops a recycled buffer or allocates a new one with
///   `default_capacity`, wrapped in a [`PooledBuffer`] guard.
/// - Dropping the guard (or calling `release()`) clears the buffer and
///   returns it to the pool, or drops it if the pool is full.
/// - The pool is bounded so a traffic spike does not pin memory forever.
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    default_capacity: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    /// Creates a new buffer pool.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` is 0 or `default_capacity` is 0.
    pub fn new(pool_size: usize, default_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be positive");
        assert!(default_capacity > 0, "default_capacity must be positive");
        Self {
            pool: ArrayQueue::new(pool_size),
            default_capacity,
            max_retained_capacity: DEFAULT_MAX_RETAINED_CAPACITY.max(default_capacity),
        }
    }

    /// Caps the capacity of buffers kept for reuse.
    ///
    /// Values below the default capacity are raised to it.
    #[must_use]
    pub fn with_max_retained_capacity(mut self, max: usize) -> Self {
        self.max_retained_capacity = max.max(self.default_capacity);
        self
    }

    /// Lends a buffer out of the pool, allocating one if the pool is empty.
    ///
    /// The buffer is empty but keeps whatever capacity it had when it was
    /// returned.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.default_capacity));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Returns a buffer to the pool for reuse.
    ///
    /// The buffer is cleared before being placed back. If the pool is full,
    /// or the buffer grew beyond the retained-capacity cap, it is dropped.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained_capacity {
            return;
        }
        buf.clear();
        // Full pool: shed the buffer rather than grow.
        let _ = self.pool.push(buf);
    }

    /// Returns the number of buffers currently available in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Returns the capacity given to freshly allocated buffers.
    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.pool.len())
            .field("capacity", &self.pool.capacity())
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(128, DEFAULT_BUFFER_CAPACITY)
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Goes back to the pool when dropped, so every exit path of a read returns
/// it, including early returns on error.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Detaches the buffer from the pool. It will not be recycled.
    pub fn into_inner(mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // Zero capacity means `into_inner` already moved the allocation out.
        if buf.capacity() > 0 {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
