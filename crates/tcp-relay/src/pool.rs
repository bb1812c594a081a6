//! Shared pool of fixed-size read buffers.
//!
//! Each pump checks a chunk out for exactly one read-process-write cycle
//! and returns it by dropping the guard. The pool is lock-free; when it is
//! empty a fresh buffer is allocated, and when it is full a returned buffer
//! is simply dropped.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Maximum bytes read from a connection in one cycle.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default number of buffers retained by the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// A lock-free pool of `chunk_size`-byte buffers.
pub struct ChunkPool {
    buffers: ArrayQueue<Vec<u8>>,
    chunk_size: usize,
}

impl ChunkPool {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            chunk_size,
        }
    }

    /// Pool with the relay defaults (256 buffers of 64 KiB).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, CHUNK_SIZE)
    }

    /// Check a buffer out, reusing a pooled one when available.
    pub fn get(self: &Arc<Self>) -> Chunk {
        let mut buf = self.buffers.pop().unwrap_or_default();
        buf.resize(self.chunk_size, 0);
        Chunk {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        // A full pool drops the buffer.
        let _ = self.buffers.push(buf);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

/// A buffer checked out of a [`ChunkPool`]; returned on drop.
pub struct Chunk {
    buf: Option<Vec<u8>>,
    pool: Arc<ChunkPool>,
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_out_chunk_has_full_length() {
        let pool = Arc::new(ChunkPool::new(4, 1024));
        let chunk = pool.get();
        assert_eq!(chunk.len(), 1024);
    }

    #[test]
    fn dropped_chunk_returns_to_the_pool() {
        let pool = Arc::new(ChunkPool::new(4, 1024));
        assert_eq!(pool.available(), 0);

        let chunk = pool.get();
        drop(chunk);
        assert_eq!(pool.available(), 1);

        // The next checkout reuses it.
        let _chunk = pool.get();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn full_pool_drops_extra_returns() {
        let pool = Arc::new(ChunkPool::new(1, 64));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn chunks_are_independent() {
        let pool = Arc::new(ChunkPool::new(4, 16));
        let mut a = pool.get();
        let mut b = pool.get();
        a[0] = 1;
        b[0] = 2;
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }
}
