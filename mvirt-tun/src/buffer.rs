//! Shared packet buffer pool.
//!
//! Buffers are recycled through a lock-free free list so the device reader
//! and any number of flow handler tasks can allocate and release them
//! concurrently. A `PoolBuffer` goes back to the pool when dropped, which
//! makes a double release or a leak impossible regardless of which path
//! consumed the packet.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

/// Number of idle buffers the pool keeps around.
pub const POOL_SIZE: usize = 512;

/// Shared pool of packet buffers.
pub struct BufferPool {
    /// Free list of idle buffers.
    free: ArrayQueue<Vec<u8>>,
    /// Nominal buffer size (the device MTU).
    buffer_size: usize,
    /// Buffers currently handed out.
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of buffers sized for `buffer_size` byte packets.
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Self::with_capacity(buffer_size, POOL_SIZE)
    }

    /// Create a pool that keeps at most `pool_size` idle buffers.
    pub fn with_capacity(buffer_size: usize, pool_size: usize) -> Arc<Self> {
        tracing::debug!(buffer_size, pool_size, "Buffer pool created");
        Arc::new(Self {
            free: ArrayQueue::new(pool_size.max(1)),
            buffer_size,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// Reuses an idle buffer when one is available and allocates otherwise,
    /// so allocation never fails.
    pub fn alloc(self: &Arc<Self>, len: usize) -> PoolBuffer {
        let mut data = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size.max(len)));
        data.clear();
        data.resize(len, 0);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PoolBuffer {
            pool: Arc::clone(self),
            data,
        }
    }

    /// Allocate a buffer of the nominal size, ready for a device read.
    pub fn alloc_mtu(self: &Arc<Self>) -> PoolBuffer {
        self.alloc(self.buffer_size)
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn alloc_from(self: &Arc<Self>, bytes: &[u8]) -> PoolBuffer {
        let mut buf = self.alloc(bytes.len());
        buf.data_mut().copy_from_slice(bytes);
        buf
    }

    /// Nominal buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn return_buffer(&self, data: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Oversized buffers (reassembled packets) are not worth keeping.
        if data.capacity() >= self.buffer_size && data.capacity() <= 2 * self.buffer_size {
            let _ = self.free.push(data);
        }
    }
}

/// A buffer owned from the pool.
///
/// Automatically returns to the pool when dropped.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    data: Vec<u8>,
}

impl PoolBuffer {
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shrink or grow the valid data to `len` bytes (new bytes are zeroed).
    pub fn set_len(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// The pool this buffer belongs to.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.return_buffer(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
