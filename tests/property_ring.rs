//! Checks `CircularBuffer` against a `VecDeque` model over random operation sequences.
use std::collections::VecDeque;

use proptest::prelude::*;
use sockweave::{ring::CircularBuffer, WebSocketError};

#[derive(Debug, Clone)]
enum Op {
    Write(Vec<u8>),
    CopyFrom {
        data: Vec<u8>,
        offset: usize,
        len: usize,
    },
    CopyTo {
        offset: usize,
        len: usize,
    },
    Consume(usize),
    Skip(usize),
    SetCapacity(usize),
    Truncate(usize),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::collection::vec(any::<u8>(), 0..48).prop_map(Op::Write),
        3 => (proptest::collection::vec(any::<u8>(), 0..32), 0usize..40, 0usize..40)
            .prop_map(|(data, offset, len)| Op::CopyFrom { data, offset, len }),
        3 => (0usize..40, 0usize..40).prop_map(|(offset, len)| Op::CopyTo { offset, len }),
        2 => (0usize..40).prop_map(Op::Consume),
        2 => (0usize..40).prop_map(Op::Skip),
        1 => (1usize..160).prop_map(Op::SetCapacity),
        1 => (1usize..160).prop_map(Op::Truncate),
        1 => Just(Op::Clear),
    ]
}

const MAX_CAPACITY: usize = 128;

proptest! {
    #[test]
    fn behaves_like_a_deque(initial in 1usize..16, ops in proptest::collection::vec(op(), 1..64)) {
        let mut ring = CircularBuffer::<u8>::new(initial, MAX_CAPACITY).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Write(data) => {
                    let res = ring.write_span(&data);
                    if model.len() + data.len() > MAX_CAPACITY {
                        prop_assert!(res.is_err());
                    } else {
                        prop_assert!(res.is_ok());
                        model.extend(data.iter().copied());
                    }
                }
                Op::CopyFrom { data, offset, len } => {
                    let res = ring.copy_from(&data, offset, len);
                    if offset + len > data.len() {
                        let is_out_of_range = matches!(res, Err(WebSocketError::OutOfRange { .. }));
                        prop_assert!(is_out_of_range);
                    } else if model.len() + len > MAX_CAPACITY {
                        prop_assert!(res.is_err());
                    } else {
                        prop_assert!(res.is_ok());
                        model.extend(data[offset..offset + len].iter().copied());
                    }
                }
                Op::CopyTo { offset, len } => {
                    let mut dest = vec![0u8; len];
                    let res = ring.copy_to(offset, &mut dest);
                    if offset + len > model.len() {
                        let is_out_of_range = matches!(res, Err(WebSocketError::OutOfRange { .. }));
                        prop_assert!(is_out_of_range);
                    } else {
                        prop_assert!(res.is_ok());
                        let expected: Vec<u8> = model.range(offset..offset + len).copied().collect();
                        prop_assert_eq!(dest, expected);
                    }
                }
                Op::Consume(n) => {
                    let mut dest = vec![0u8; n];
                    let moved = ring.consume(&mut dest);
                    let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    prop_assert_eq!(moved, expected.len());
                    prop_assert_eq!(&dest[..moved], &expected[..]);
                }
                Op::Skip(n) => {
                    let res = ring.skip(n);
                    if n > model.len() {
                        prop_assert!(res.is_err());
                    } else {
                        prop_assert!(res.is_ok());
                        model.drain(..n);
                    }
                }
                Op::SetCapacity(capacity) => {
                    let res = ring.set_capacity(capacity);
                    if capacity > MAX_CAPACITY || capacity < model.len() {
                        prop_assert!(res.is_err());
                    } else {
                        prop_assert!(res.is_ok());
                        prop_assert_eq!(ring.capacity(), capacity);
                    }
                }
                Op::Truncate(capacity) => {
                    let res = ring.truncate_capacity(capacity);
                    if capacity > MAX_CAPACITY {
                        prop_assert!(res.is_err());
                    } else {
                        let dropped = model.len().saturating_sub(capacity);
                        prop_assert_eq!(res.unwrap(), dropped);
                        model.truncate(model.len() - dropped);
                    }
                }
                Op::Clear => {
                    ring.clear();
                    model.clear();
                }
            }

            prop_assert_eq!(ring.len(), model.len());
            prop_assert!(ring.capacity() <= MAX_CAPACITY);
            prop_assert_eq!(ring.to_vec(), model.iter().copied().collect::<Vec<_>>());
        }
    }

    #[test]
    fn ring_to_ring_copy_matches_source(
        prefix in 0usize..24,
        data in proptest::collection::vec(any::<u8>(), 1..32),
        dest_prefix in 0usize..24,
        offset in 0usize..32,
    ) {
        // offsets force both rings to wrap
        let mut source = CircularBuffer::<u8>::new(32, 32).unwrap();
        source.write_span(&vec![0xEE; prefix]).unwrap();
        source.skip(prefix).unwrap();
        source.write_span(&data).unwrap();

        let mut dest = CircularBuffer::<u8>::new(64, 64).unwrap();
        dest.write_span(&vec![0xAA; dest_prefix]).unwrap();
        dest.skip(dest_prefix).unwrap();

        let offset = offset % data.len();
        let length = data.len() - offset;
        dest.copy_from_ring(&source, offset, length).unwrap();

        prop_assert_eq!(dest.to_vec(), data[offset..].to_vec());
        prop_assert_eq!(source.to_vec(), data);
    }
}

#[test]
fn growth_is_capped_at_max_capacity() {
    let mut ring = CircularBuffer::<u8>::new(4, 100).unwrap();
    ring.write_span(&[1; 70]).unwrap();
    // next power of two would be 128
    assert_eq!(ring.capacity(), 100);
    assert!(ring.write_span(&[1; 31]).is_err());
    assert_eq!(ring.len(), 70);
}
