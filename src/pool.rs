//! Lock-free buffer pool for reusing I/O buffers
//!
//! Every read and copy loop in the proxy borrows a buffer from this pool
//! instead of allocating, which keeps the per-connection hot path free of
//! allocator traffic. Buffers return to the pool automatically when the
//! lease is dropped, including on error paths.

use crossbeam::queue::SegQueue;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Default capacity of each pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of buffers kept in the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// A pooled buffer that returns itself to the pool when dropped.
///
/// The lease has exclusive ownership of the underlying bytes for its whole
/// lifetime; no other task can observe or reuse them until it is dropped.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<SegQueue<Vec<u8>>>,
    pool_size: Arc<AtomicUsize>,
    max_pool_size: usize,
}

impl PooledBuffer {
    /// Capacity of the buffer in bytes.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Mutable access to the full buffer, for reads to fill.
    #[must_use]
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer[..]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Atomically reserve a slot; if the pool is full the buffer is freed.
        let mut current_size = self.pool_size.load(Ordering::Relaxed);
        while current_size < self.max_pool_size {
            match self.pool_size.compare_exchange_weak(
                current_size,
                current_size + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.pool.push(std::mem::take(&mut self.buffer));
                    return;
                }
                Err(new_size) => current_size = new_size,
            }
        }
    }
}

/// Lock-free pool of fixed-capacity byte buffers.
///
/// Cloning is cheap and shares the same underlying pool. Acquire never
/// fails: when the pool is empty a fresh buffer is allocated, and on drop
/// it is either pooled (if a slot is free) or released.
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: Arc<SegQueue<Vec<u8>>>,
    buffer_size: usize,
    max_pool_size: usize,
    pool_size: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool with `max_pool_size` buffers of `buffer_size` bytes,
    /// all pre-allocated up front.
    #[must_use]
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        let pool = Arc::new(SegQueue::new());
        let pool_size = Arc::new(AtomicUsize::new(0));

        for _ in 0..max_pool_size {
            pool.push(vec![0u8; buffer_size]);
            pool_size.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            "pre-allocated {} buffers of {} KiB",
            max_pool_size,
            buffer_size / 1024
        );

        Self {
            pool,
            buffer_size,
            max_pool_size,
            pool_size,
        }
    }

    /// Lease a buffer from the pool, or allocate one if the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = if let Some(buffer) = self.pool.pop() {
            self.pool_size.fetch_sub(1, Ordering::Relaxed);
            debug_assert_eq!(buffer.len(), self.buffer_size);
            buffer
        } else {
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.pool),
            pool_size: Arc::clone(&self.pool_size),
            max_pool_size: self.max_pool_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_full_capacity() {
        let pool = BufferPool::new(8192, 4);
        let buffer = pool.acquire();
        assert_eq!(buffer.capacity(), 8192);
        assert_eq!(buffer.len(), 8192);
    }

    #[test]
    fn buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::new(1024, 1);
        {
            let mut buffer = pool.acquire();
            buffer.as_mut_slice()[0] = 0xAB;
        }
        // The single pooled buffer came back, so this is the same allocation.
        let reused = pool.acquire();
        assert_eq!(reused[0], 0xAB);
    }

    #[test]
    fn exhausted_pool_allocates_fresh_buffers() {
        let pool = BufferPool::new(512, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(c.capacity(), 512);
        drop((a, b, c));
    }

    #[test]
    fn pool_never_grows_past_capacity() {
        let pool = BufferPool::new(256, 2);
        let leases: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(leases);
        assert_eq!(pool.pool_size.load(Ordering::Relaxed), 2);
        assert_eq!(pool.pool.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_leases_are_exclusive() {
        let pool = BufferPool::new(64, 8);
        let mut handles = Vec::new();

        for i in 0..32u8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut buffer = pool.acquire();
                buffer.as_mut_slice().fill(i);
                tokio::task::yield_now().await;
                // Nobody else may have touched this lease in the meantime.
                assert!(buffer.iter().all(|&b| b == i));
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
