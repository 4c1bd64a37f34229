//! # Buffer Pool
//!
//! A pool of fixed-size byte buffers shared by every connection that uses it. Reads,
//! session-buffer storage and scratch copies borrow from the pool instead of allocating
//! per message.
//!
//! Every buffer the pool hands out is exactly [`BufferPool::buffer_size`] bytes long.
//! Ownership moves to the borrower and back to the pool on [`BufferPool::release`]; once a
//! buffer has been released the caller no longer holds it, which the move enforces.
//!
//! When the pool runs dry and auto-expansion is enabled, it grows by its scale factor in one
//! step under the lock: a pool of `n` buffers with scale `s` allocates `ceil(s * n) - n` new
//! buffers and hands one of them out. Pools never shrink.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use bytes::BytesMut;

use crate::{Result, WebSocketError};

/// Size of each pooled buffer unless configured otherwise, 8 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Number of buffers a default pool starts with.
pub const DEFAULT_POOL_COUNT: usize = 4;

/// Growth factor a default pool expands by when exhausted.
pub const DEFAULT_SCALE: f64 = 2.0;

/// A thread-safe pool of fixed-size byte buffers.
///
/// # Example
/// ```
/// use sockweave::pool::BufferPool;
///
/// let pool = BufferPool::new(1024, 2, true, 2.0)?;
/// let buf = pool.borrow()?;
/// assert_eq!(buf.len(), 1024);
/// pool.release(buf)?;
/// # Ok::<(), sockweave::WebSocketError>(())
/// ```
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    auto_expand: bool,
    scale: f64,
    free: Mutex<Vec<BytesMut>>,
    /// Buffers ever created by this pool.
    total: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `buffer_size` bytes each.
    ///
    /// `scale` must be greater than 1 and is only used when `auto_expand` is set.
    pub fn new(buffer_size: usize, count: usize, auto_expand: bool, scale: f64) -> Result<Self> {
        if buffer_size == 0 {
            return Err(WebSocketError::InvalidArgument("buffer size must be positive"));
        }
        if !(scale > 1.0 && scale.is_finite()) {
            return Err(WebSocketError::InvalidArgument("scale must be greater than 1"));
        }

        let free = (0..count).map(|_| zeroed(buffer_size)).collect();
        Ok(Self {
            buffer_size,
            auto_expand,
            scale,
            free: Mutex::new(free),
            total: AtomicUsize::new(count),
        })
    }

    /// The size in bytes of every buffer this pool lends.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers owned by the pool, lent or not.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of buffers currently lent out.
    pub fn outstanding(&self) -> usize {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        self.total.load(Ordering::Acquire) - free.len()
    }

    /// Whether the pool grows when it runs out of buffers.
    pub fn auto_expand(&self) -> bool {
        self.auto_expand
    }

    /// Lends a buffer of exactly [`buffer_size`](Self::buffer_size) bytes.
    ///
    /// Fails with [`WebSocketError::CapacityExceeded`] when the pool is empty and
    /// auto-expansion is disabled.
    pub fn borrow(&self) -> Result<BytesMut> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(buf) = free.pop() {
            return Ok(buf);
        }

        if !self.auto_expand {
            return Err(WebSocketError::CapacityExceeded {
                requested: self.count() + 1,
                limit: self.count(),
            });
        }

        let current = self.total.load(Ordering::Acquire);
        let target = ((current as f64) * self.scale).ceil() as usize;
        let grow = target.saturating_sub(current).max(1);

        free.extend((0..grow - 1).map(|_| zeroed(self.buffer_size)));
        self.total.store(current + grow, Ordering::Release);

        #[cfg(feature = "logging")]
        log::debug!(
            "buffer pool expanded from {current} to {} buffers of {} bytes",
            current + grow,
            self.buffer_size
        );

        Ok(zeroed(self.buffer_size))
    }

    /// Returns a buffer to the pool.
    ///
    /// The buffer must be one this pool lent: a buffer whose length differs from
    /// [`buffer_size`](Self::buffer_size), or a release while nothing is lent, fails with
    /// [`WebSocketError::InvalidArgument`].
    pub fn release(&self, buf: BytesMut) -> Result<()> {
        if buf.len() != self.buffer_size {
            return Err(WebSocketError::InvalidArgument(
                "released buffer does not match the pool buffer size",
            ));
        }

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() >= self.total.load(Ordering::Acquire) {
            return Err(WebSocketError::InvalidArgument(
                "released buffer was not borrowed from this pool",
            ));
        }
        free.push(buf);
        Ok(())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            auto_expand: true,
            scale: DEFAULT_SCALE,
            free: Mutex::new(
                (0..DEFAULT_POOL_COUNT)
                    .map(|_| zeroed(DEFAULT_BUFFER_SIZE))
                    .collect(),
            ),
            total: AtomicUsize::new(DEFAULT_POOL_COUNT),
        }
    }
}

fn zeroed(size: usize) -> BytesMut {
    BytesMut::zeroed(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_borrow_returns_fixed_size() {
        let pool = BufferPool::new(64, 2, false, 2.0).unwrap();
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 64);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_exhausted_without_expand_fails() {
        let pool = BufferPool::new(16, 1, false, 2.0).unwrap();
        let _held = pool.borrow().unwrap();
        assert!(matches!(
            pool.borrow(),
            Err(WebSocketError::CapacityExceeded { .. })
        ));
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_auto_expand_by_scale() {
        let pool = BufferPool::new(16, 4, true, 1.5).unwrap();
        let held: Vec<_> = (0..4).map(|_| pool.borrow().unwrap()).collect();
        assert_eq!(pool.available(), 0);

        // 4 * 1.5 = 6, so two new buffers: one lent, one left in the pool.
        let extra = pool.borrow().unwrap();
        assert_eq!(pool.count(), 6);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 5);

        for buf in held {
            pool.release(buf).unwrap();
        }
        pool.release(extra).unwrap();
        assert_eq!(pool.available(), 6);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_expand_from_empty_pool() {
        let pool = BufferPool::new(8, 0, true, 2.0).unwrap();
        let buf = pool.borrow().unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_release_rejects_foreign_buffers() {
        let pool = BufferPool::new(32, 1, false, 2.0).unwrap();
        assert!(matches!(
            pool.release(BytesMut::zeroed(16)),
            Err(WebSocketError::InvalidArgument(_))
        ));
        // Right size, but nothing is lent.
        assert!(matches!(
            pool.release(BytesMut::zeroed(32)),
            Err(WebSocketError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(BufferPool::new(0, 1, true, 2.0).is_err());
        assert!(BufferPool::new(8, 1, true, 1.0).is_err());
        assert!(BufferPool::new(8, 1, true, f64::NAN).is_err());
    }

    #[test]
    fn test_concurrent_borrow_release_conserves_buffers() {
        let pool = Arc::new(BufferPool::new(128, 2, true, 2.0).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let buf = pool.borrow().unwrap();
                        assert_eq!(buf.len(), 128);
                        pool.release(buf).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), pool.count());
    }
}
