//! Write buffer pool shared between connections.
//!
//! Buffers are keyed by their requested size. A connection acquires its
//! write buffer when it is built and the buffer goes back to the pool when
//! the connection is dropped, whichever way it ended.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Idle buffers kept per size class by default.
const DEFAULT_MAX_IDLE: usize = 64;

/// A cloneable handle to a size-keyed pool of `BytesMut` buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_idle: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    /// Keep at most `max_idle` returned buffers per size.
    #[must_use]
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(HashMap::new()),
                max_idle,
            }),
        }
    }

    /// Take a buffer with at least `size` bytes of capacity.
    #[must_use]
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let reused = self
            .inner
            .idle
            .lock()
            .get_mut(&size)
            .and_then(Vec::pop);
        PooledBuffer {
            buf: reused.unwrap_or_else(|| BytesMut::with_capacity(size)),
            size,
            pool: Some(self.clone()),
        }
    }

    /// Number of idle buffers of `size`.
    #[must_use]
    pub fn idle(&self, size: usize) -> usize {
        self.inner.idle.lock().get(&size).map_or(0, Vec::len)
    }

    fn release(&self, size: usize, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < size {
            return;
        }
        let mut idle = self.inner.idle.lock();
        let slot = idle.entry(size).or_default();
        if slot.len() < self.inner.max_idle {
            slot.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle = self.inner.idle.lock();
        f.debug_struct("BufferPool")
            .field("sizes", &idle.len())
            .field("idle", &idle.values().map(Vec::len).sum::<usize>())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

/// A buffer that returns to its pool on drop.
///
/// Built with [`PooledBuffer::unpooled`] it is just an owned buffer.
pub struct PooledBuffer {
    buf: BytesMut,
    size: usize,
    pool: Option<BufferPool>,
}

impl PooledBuffer {
    #[must_use]
    pub fn unpooled(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            size,
            pool: None,
        }
    }

    /// Size class this buffer was requested with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
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
        if let Some(pool) = self.pool.take() {
            pool.release(self.size, std::mem::take(&mut self.buf));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("size", &self.size)
            .field("len", &self.buf.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
