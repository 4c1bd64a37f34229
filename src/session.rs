//! # Session Receive Buffer
//!
//! TCP has no message boundaries, so a read may end in the middle of a frame header or carry
//! several frames at once. [`SessionBuffer`] accumulates the bytes of one connection until the
//! codec can decode a whole frame, and then drops exactly that frame from the front.
//!
//! Valid bytes always occupy `[0, len)` of the backing storage. The storage is a pool buffer
//! while the data fits in one, and a private allocation of `2 * (existing + incoming)` bytes
//! once it doesn't. Pooled storage goes back to the pool when the buffer outgrows it and when
//! the session buffer is released or dropped, exactly once.
use std::sync::Arc;

use bytes::BytesMut;

use crate::{pool::BufferPool, Result, WebSocketError};

/// Backing storage of a [`SessionBuffer`].
enum Storage {
    /// Borrowed from the pool, returned on growth or release.
    Pooled(BytesMut),
    /// Too large for a pool buffer.
    Owned(BytesMut),
    /// Released.
    Empty,
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Pooled(buf) | Storage::Owned(buf) => buf,
            Storage::Empty => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Pooled(buf) | Storage::Owned(buf) => buf,
            Storage::Empty => &mut [],
        }
    }
}

/// A growable per-connection receive buffer backed by a [`BufferPool`].
pub struct SessionBuffer {
    pool: Arc<BufferPool>,
    storage: Storage,
    len: usize,
}

impl SessionBuffer {
    /// Creates a session buffer whose initial storage is borrowed from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Result<Self> {
        let buf = pool.borrow()?;
        Ok(Self {
            pool,
            storage: Storage::Pooled(buf),
            len: 0,
        })
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.bytes().len()
    }

    /// Whether the storage is currently a pool buffer.
    pub fn is_pooled(&self) -> bool {
        matches!(self.storage, Storage::Pooled(_))
    }

    /// The buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.bytes()[..self.len]
    }

    /// Appends `data` after the buffered bytes, growing the storage when needed.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if matches!(self.storage, Storage::Empty) {
            return Err(WebSocketError::ConnectionClosed);
        }

        let needed = self.len + data.len();
        if needed > self.capacity() {
            self.grow(needed)?;
        }

        self.storage.bytes_mut()[self.len..needed].copy_from_slice(data);
        self.len = needed;
        Ok(())
    }

    /// Removes the first `n` bytes, moving the remainder to the front.
    ///
    /// Fails with [`WebSocketError::OutOfRange`] if fewer than `n` bytes are buffered.
    pub fn shift(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(WebSocketError::OutOfRange {
                requested: n,
                available: self.len,
            });
        }

        let remainder = self.len - n;
        if remainder == 0 {
            self.len = 0;
            return Ok(());
        }

        let scratch = if remainder >= n && remainder <= self.pool.buffer_size() {
            // an exhausted pool that cannot expand falls through to the in-place move
            self.pool.borrow().ok()
        } else {
            None
        };

        match scratch {
            Some(mut scratch) => {
                scratch[..remainder].copy_from_slice(&self.storage.bytes()[n..self.len]);
                self.storage.bytes_mut()[..remainder].copy_from_slice(&scratch[..remainder]);
                self.pool.release(scratch)?;
            }
            None => self.storage.bytes_mut().copy_within(n..self.len, 0),
        }

        self.len = remainder;
        Ok(())
    }

    /// Discards every buffered byte while keeping the storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns pooled storage to the pool. Further appends fail with
    /// [`WebSocketError::ConnectionClosed`]. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        self.len = 0;
        if let Storage::Pooled(buf) = std::mem::replace(&mut self.storage, Storage::Empty) {
            // the buffer came from this pool, so the only failure is a mismatched pool
            let _ = self.pool.release(buf);
        }
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        let mut next = if needed <= self.pool.buffer_size() {
            Storage::Pooled(self.pool.borrow()?)
        } else {
            Storage::Owned(BytesMut::zeroed(2 * needed))
        };

        next.bytes_mut()[..self.len].copy_from_slice(self.as_slice());

        if let Storage::Pooled(old) = std::mem::replace(&mut self.storage, next) {
            self.pool.release(old)?;
        }
        Ok(())
    }
}

impl Drop for SessionBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
