//! # Circular Buffer
//!
//! A bounded ring buffer used for streaming byte data. Items are appended at the tail and
//! consumed from the head; logical index `i` lives at `(head + i) % capacity`.
//!
//! All wraparound arithmetic goes through one function, [`spans`], which splits a logical
//! region into at most two contiguous physical ranges. Every copy in this module is built from
//! those ranges, so a ring-to-ring copy where both sides wrap becomes at most three slice
//! copies and never touches memory outside `[0, capacity)`.
//!
//! Capacity grows on demand: to the next power of two of the needed size, or to
//! `needed + 1 MiB` once more than 1 MiB is needed, never beyond `max_capacity`. Growth
//! re-linearizes the contents so that `head == 0`.
//!
//! Shrinking never loses data silently: [`CircularBuffer::set_capacity`] refuses to go below
//! the current length, and [`CircularBuffer::truncate_capacity`] is the explicit lossy form.
use std::ops::{Index, Range};

use crate::{Result, WebSocketError};

/// Above this many items growth becomes linear instead of doubling.
pub const LINEAR_GROWTH_THRESHOLD: usize = 1024 * 1024;

/// Splits `len` items starting at physical index `start` of a ring of `capacity` slots into
/// two contiguous ranges. The second range is empty unless the region wraps.
///
/// Requires `start < capacity` and `len <= capacity`.
fn spans(start: usize, len: usize, capacity: usize) -> (Range<usize>, Range<usize>) {
    debug_assert!(start < capacity && len <= capacity);
    let first = len.min(capacity - start);
    (start..start + first, 0..len - first)
}

/// A growable ring buffer with a hard capacity ceiling.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    buf: Vec<T>,
    head: usize,
    tail: usize,
    count: usize,
    max_capacity: usize,
}

impl<T: Copy + Default> CircularBuffer<T> {
    /// Creates an empty ring with `capacity` slots that may grow up to `max_capacity`.
    pub fn new(capacity: usize, max_capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(WebSocketError::InvalidArgument("capacity must be positive"));
        }
        if capacity > max_capacity {
            return Err(WebSocketError::InvalidArgument(
                "capacity must not exceed max capacity",
            ));
        }

        Ok(Self {
            buf: vec![T::default(); capacity],
            head: 0,
            tail: 0,
            count: 0,
            max_capacity,
        })
    }

    /// Number of items stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Current number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Physical index of the oldest item.
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    /// Physical index the next appended item goes to.
    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Returns the item at logical index `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.count {
            Some(&self.buf[(self.head + index) % self.capacity()])
        } else {
            None
        }
    }

    /// Borrows the logical region `[offset, offset + len)` as up to two slices.
    pub fn read_span(&self, offset: usize, len: usize) -> Result<(&[T], &[T])> {
        self.check_region(offset, len)?;
        if len == 0 {
            return Ok((&[], &[]));
        }

        let start = (self.head + offset) % self.capacity();
        let (a, b) = spans(start, len, self.capacity());
        Ok((&self.buf[a], &self.buf[b]))
    }

    /// Appends `data` at the tail, growing if needed.
    pub fn write_span(&mut self, data: &[T]) -> Result<()> {
        self.reserve(data.len())?;
        self.push_unchecked(data);
        Ok(())
    }

    /// Appends `source[offset..offset + length]`.
    pub fn copy_from(&mut self, source: &[T], offset: usize, length: usize) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= source.len())
            .ok_or(WebSocketError::OutOfRange {
                requested: offset.saturating_add(length),
                available: source.len(),
            })?;
        self.write_span(&source[offset..end])
    }

    /// Appends the logical region `[offset, offset + length)` of another ring.
    ///
    /// The source is left untouched. Either side may wrap.
    pub fn copy_from_ring(
        &mut self,
        source: &CircularBuffer<T>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        let (a, b) = source.read_span(offset, length)?;
        self.reserve(length)?;
        self.push_unchecked(a);
        self.push_unchecked(b);
        Ok(())
    }

    /// Copies the logical region starting at `offset` into `dest`, filling it completely.
    pub fn copy_to(&self, offset: usize, dest: &mut [T]) -> Result<()> {
        let (a, b) = self.read_span(offset, dest.len())?;
        dest[..a.len()].copy_from_slice(a);
        dest[a.len()..].copy_from_slice(b);
        Ok(())
    }

    /// Moves up to `dest.len()` items from the head into `dest`, returning how many moved.
    pub fn consume(&mut self, dest: &mut [T]) -> usize {
        let n = dest.len().min(self.count);
        if n == 0 {
            return 0;
        }
        let (a, b) = spans(self.head, n, self.capacity());
        let split = a.len();
        dest[..split].copy_from_slice(&self.buf[a]);
        dest[split..n].copy_from_slice(&self.buf[b]);
        self.advance_head(n);
        n
    }

    /// Drops `n` items from the head.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.count {
            return Err(WebSocketError::OutOfRange {
                requested: n,
                available: self.count,
            });
        }
        if n > 0 {
            self.advance_head(n);
        }
        Ok(())
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// The items in logical order.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = vec![T::default(); self.count];
        if self.count > 0 {
            // the full region always exists
            let (a, b) = spans(self.head, self.count, self.capacity());
            let split = a.len();
            out[..split].copy_from_slice(&self.buf[a]);
            out[split..].copy_from_slice(&self.buf[b]);
        }
        out
    }

    /// Makes room for `additional` more items following the growth policy.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self
            .count
            .checked_add(additional)
            .ok_or(WebSocketError::CapacityExceeded {
                requested: usize::MAX,
                limit: self.max_capacity,
            })?;
        if needed <= self.capacity() {
            return Ok(());
        }
        if needed > self.max_capacity {
            return Err(WebSocketError::CapacityExceeded {
                requested: needed,
                limit: self.max_capacity,
            });
        }

        let target = if needed > LINEAR_GROWTH_THRESHOLD {
            needed.saturating_add(LINEAR_GROWTH_THRESHOLD)
        } else {
            needed.next_power_of_two()
        };
        self.relinearize(target.min(self.max_capacity));
        Ok(())
    }

    /// Resizes to exactly `capacity` slots without dropping items.
    ///
    /// Fails with [`WebSocketError::CapacityExceeded`] if `capacity` exceeds the maximum or is
    /// smaller than the number of stored items.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(WebSocketError::InvalidArgument("capacity must be positive"));
        }
        if capacity > self.max_capacity {
            return Err(WebSocketError::CapacityExceeded {
                requested: capacity,
                limit: self.max_capacity,
            });
        }
        if capacity < self.count {
            return Err(WebSocketError::CapacityExceeded {
                requested: self.count,
                limit: capacity,
            });
        }
        self.relinearize(capacity);
        Ok(())
    }

    /// Resizes to `capacity` slots, keeping only the oldest `capacity` items.
    ///
    /// Returns the number of items dropped from the tail.
    pub fn truncate_capacity(&mut self, capacity: usize) -> Result<usize> {
        if capacity == 0 {
            return Err(WebSocketError::InvalidArgument("capacity must be positive"));
        }
        if capacity > self.max_capacity {
            return Err(WebSocketError::CapacityExceeded {
                requested: capacity,
                limit: self.max_capacity,
            });
        }
        let dropped = self.count.saturating_sub(capacity);
        self.count -= dropped;
        self.relinearize(capacity);
        Ok(dropped)
    }

    fn check_region(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.count => Ok(()),
            _ => Err(WebSocketError::OutOfRange {
                requested: offset.saturating_add(len),
                available: self.count,
            }),
        }
    }

    /// Caller guarantees `data.len() <= capacity - count`.
    fn push_unchecked(&mut self, data: &[T]) {
        if data.is_empty() {
            return;
        }
        let (a, b) = spans(self.tail, data.len(), self.capacity());
        let split = a.len();
        self.buf[a].copy_from_slice(&data[..split]);
        self.buf[b].copy_from_slice(&data[split..]);
        self.tail = (self.tail + data.len()) % self.capacity();
        self.count += data.len();
    }

    fn advance_head(&mut self, n: usize) {
        self.head = (self.head + n) % self.capacity();
        self.count -= n;
        if self.count == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Moves the first `count` items into a fresh buffer of `capacity` slots at index 0.
    fn relinearize(&mut self, capacity: usize) {
        let mut next = vec![T::default(); capacity];
        if self.count > 0 {
            let (a, b) = spans(self.head, self.count, self.capacity());
            let split = a.len();
            next[..split].copy_from_slice(&self.buf[a]);
            next[split..self.count].copy_from_slice(&self.buf[b]);
        }
        self.buf = next;
        self.head = 0;
        self.tail = self.count % capacity;
    }
}

impl<T: Copy + Default> Index<usize> for CircularBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        match self.get(index) {
            Some(item) => item,
            None => panic!(
                "index {index} out of bounds for ring buffer of length {}",
                self.count
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(capacity: usize, max: usize, head: usize, items: &[u8]) -> CircularBuffer<u8> {
        let mut ring = CircularBuffer::new(capacity, max).unwrap();
        // rotate the head by pushing and consuming filler
        let filler = vec![0xEE; head];
        ring.write_span(&filler).unwrap();
        ring.skip(head).unwrap();
        // skip() resets an empty ring to 0, so place the head by hand
        ring.head = head % capacity;
        ring.tail = head % capacity;
        ring.write_span(items).unwrap();
        ring
    }

    #[test]
    fn test_spans() {
        assert_eq!(spans(0, 4, 8), (0..4, 0..0));
        assert_eq!(spans(6, 4, 8), (6..8, 0..2));
        assert_eq!(spans(7, 8, 8), (7..8, 0..7));
        assert_eq!(spans(3, 0, 8), (3..3, 0..0));
    }

    #[test]
    fn test_write_wraps_around() {
        let ring = ring_with(8, 8, 6, &[1, 2, 3, 4]);
        assert_eq!(ring.head(), 6);
        assert_eq!(ring.tail(), 2);
        assert_eq!(ring.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(ring[0], 1);
        assert_eq!(ring[3], 4);
        assert_eq!(ring.get(4), None);
    }

    #[test]
    fn test_read_span_split() {
        let ring = ring_with(8, 8, 5, &[1, 2, 3, 4, 5, 6]);
        let (a, b) = ring.read_span(1, 4).unwrap();
        assert_eq!(a, &[2, 3]);
        assert_eq!(b, &[4, 5]);
        assert!(ring.read_span(3, 4).is_err());
    }

    #[test]
    fn test_ring_to_ring_both_wrapping() {
        let source = ring_with(8, 8, 6, &[10, 11, 12, 13, 14, 15]);
        let mut dest = ring_with(8, 8, 7, &[1, 2]);

        dest.copy_from_ring(&source, 0, 6).unwrap();
        assert_eq!(dest.to_vec(), vec![1, 2, 10, 11, 12, 13, 14, 15]);
        assert!(dest.is_full());
        // the source is untouched
        assert_eq!(source.len(), 6);
    }

    #[test]
    fn test_copy_from_slice_bounds() {
        let mut ring = CircularBuffer::<u8>::new(4, 16).unwrap();
        ring.copy_from(&[1, 2, 3, 4, 5], 1, 3).unwrap();
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert!(matches!(
            ring.copy_from(&[1, 2, 3], 2, 2),
            Err(WebSocketError::OutOfRange { .. })
        ));
        assert!(ring.copy_from(&[1, 2, 3], usize::MAX, 2).is_err());
    }

    #[test]
    fn test_consume_and_copy_to() {
        let mut ring = ring_with(8, 8, 6, &[1, 2, 3, 4, 5]);
        let mut peek = [0u8; 3];
        ring.copy_to(1, &mut peek).unwrap();
        assert_eq!(peek, [2, 3, 4]);

        let mut out = [0u8; 4];
        assert_eq!(ring.consume(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.to_vec(), vec![5]);

        let mut rest = [0u8; 4];
        assert_eq!(ring.consume(&mut rest), 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_growth_policy_power_of_two() {
        let mut ring = CircularBuffer::<u8>::new(4, 1 << 20).unwrap();
        ring.write_span(&[0; 5]).unwrap();
        assert_eq!(ring.capacity(), 8);
        ring.write_span(&[0; 12]).unwrap();
        assert_eq!(ring.capacity(), 32);
        assert_eq!(ring.head(), 0);
    }

    #[test]
    fn test_growth_policy_linear_past_threshold() {
        let mut ring = CircularBuffer::<u8>::new(16, 8 * LINEAR_GROWTH_THRESHOLD).unwrap();
        ring.write_span(&vec![1; LINEAR_GROWTH_THRESHOLD + 1]).unwrap();
        assert_eq!(ring.capacity(), 2 * LINEAR_GROWTH_THRESHOLD + 1);
    }

    #[test]
    fn test_growth_capped_by_max() {
        let mut ring = CircularBuffer::<u8>::new(4, 20).unwrap();
        ring.write_span(&[0; 17]).unwrap();
        assert_eq!(ring.capacity(), 20);
        assert!(matches!(
            ring.write_span(&[0; 4]),
            Err(WebSocketError::CapacityExceeded {
                requested: 21,
                limit: 20
            })
        ));
        assert_eq!(ring.len(), 17);
    }

    #[test]
    fn test_growth_relinearizes_wrapped_contents() {
        let mut ring = ring_with(8, 64, 6, &[1, 2, 3, 4, 5, 6, 7, 8]);
        ring.write_span(&[9]).unwrap();
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 9);
        assert_eq!(ring.to_vec(), (1..=9).collect::<Vec<u8>>());
    }

    #[test]
    fn test_set_capacity_refuses_data_loss() {
        let mut ring = ring_with(8, 8, 3, &[1, 2, 3, 4]);
        assert!(ring.set_capacity(3).is_err());
        ring.set_capacity(4).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_truncate_capacity_keeps_oldest() {
        let mut ring = ring_with(8, 8, 5, &[1, 2, 3, 4, 5, 6]);
        let dropped = ring.truncate_capacity(4).unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(ring.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(ring.capacity(), 4);

        // growing again works from the truncated state
        ring.write_span(&[7]).unwrap();
        assert_eq!(ring.to_vec(), vec![1, 2, 3, 4, 7]);
        assert!(ring.truncate_capacity(9).is_err());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_index_out_of_bounds_panics() {
        let ring = CircularBuffer::<u8>::new(4, 4).unwrap();
        let _ = ring[0];
    }

    #[test]
    fn test_invalid_construction() {
        assert!(CircularBuffer::<u8>::new(0, 4).is_err());
        assert!(CircularBuffer::<u8>::new(8, 4).is_err());
    }
}
