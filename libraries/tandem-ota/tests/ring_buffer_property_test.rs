//! Property-based tests for the ring buffer
//!
//! Random interleavings of pushes and pops must behave like a FIFO queue,
//! including across the wraparound point.

use proptest::prelude::*;
use std::collections::VecDeque;
use tandem_ota::RingBuffer;

// ===== Helpers =====

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Pop(usize),
    PopExact(usize),
}

fn arbitrary_op(capacity: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..=capacity).prop_map(Op::Push),
        (0..=capacity).prop_map(Op::Pop),
        (1..=capacity).prop_map(Op::PopExact),
    ]
}

fn scenario() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (1usize..64).prop_flat_map(|capacity| {
        (
            Just(capacity),
            prop::collection::vec(arbitrary_op(capacity), 1..200),
        )
    })
}

// ===== Property Tests =====

proptest! {
    /// Property: popped bytes equal pushed bytes, in order, never lost or duplicated
    #[test]
    fn behaves_like_a_fifo((capacity, ops) in scenario()) {
        let ring = RingBuffer::new(capacity);
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(data) => {
                    let pushed = ring.try_push(&data);
                    let room = capacity - model.len();
                    prop_assert_eq!(pushed, data.len().min(room));
                    model.extend(&data[..pushed]);
                }
                Op::Pop(len) => {
                    let mut out = vec![0u8; len];
                    let popped = ring.try_pop(&mut out);
                    prop_assert_eq!(popped, len.min(model.len()));
                    let expected: Vec<u8> = model.drain(..popped).collect();
                    prop_assert_eq!(&out[..popped], &expected[..]);
                }
                Op::PopExact(len) => {
                    let mut out = vec![0u8; len];
                    let enough = model.len() >= len;
                    prop_assert_eq!(ring.pop_exact(&mut out), enough);
                    if enough {
                        let expected: Vec<u8> = model.drain(..len).collect();
                        prop_assert_eq!(out, expected);
                    }
                }
            }

            prop_assert_eq!(ring.len(), model.len());
            prop_assert_eq!(ring.len() + ring.free(), capacity);
        }
    }

    /// Property: a clear always leaves an empty, fully free ring
    #[test]
    fn clear_resets_everything((capacity, ops) in scenario()) {
        let ring = RingBuffer::new(capacity);
        for op in ops {
            if let Op::Push(data) = op {
                ring.try_push(&data);
            }
        }

        ring.clear();

        prop_assert!(ring.is_empty());
        prop_assert_eq!(ring.free(), capacity);
    }
}
