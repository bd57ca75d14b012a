//! Randomized stress and regression tests for `tag_alloc`.
//!
//! [`Operations`] is an arbitrary interleaving of allocations and frees.
//! Replaying one verifies, after every single operation, that the heap
//! invariants hold (`TagAlloc::check`), that payloads are 8-aligned and
//! pairwise disjoint, and that freed payloads still hold the pattern
//! written into them (the allocator must never touch live user data).
//! The `extra_assertions` feature is enabled here, so the allocator is also
//! re-verifying itself and poisoning freed memory internally on every call.

use std::ptr::{self, NonNull};

use quickcheck::{Arbitrary, Gen};
use tag_alloc::TagAlloc;

/// One step of an allocation trace.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Allocate this many bytes.
    Alloc(usize),

    /// Free the n^th allocation made so far, or no-op if it has already
    /// been freed.
    Free(usize),
}

pub use Operation::*;

const NUM_OPERATIONS: usize = 600;

// Mostly small blocks, with page-size-and-above requests mixed in to force
// heap growth mid-trace. The sizes straddle the split threshold and the
// rounding boundaries on 64-bit targets.
const ALLOC_SIZES: &[usize] = &[
    1, 7, 8, 16, 23, 24, 25, 32, 48, 56, 64, 96, 200, 512, 1024, 2048, 4096, 8192,
];

impl Operation {
    fn arbitrary_alloc(g: &mut Gen, active: &mut Vec<usize>, num_allocs: &mut usize) -> Self {
        active.push(*num_allocs);
        *num_allocs += 1;

        // A zero-size request now and then; it must stay inert.
        if u8::arbitrary(g) % 50 == 0 {
            return Alloc(0);
        }

        Alloc(*g.choose(ALLOC_SIZES).unwrap())
    }

    fn arbitrary_free(g: &mut Gen, active: &mut Vec<usize>) -> Self {
        assert!(!active.is_empty());
        // Two draws spread the index past any size bound on a single one.
        let raw = usize::arbitrary(g)
            .wrapping_mul(97)
            .wrapping_add(usize::arbitrary(g));
        Free(active.swap_remove(raw % active.len()))
    }
}

/// A whole allocation trace.
#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut num_allocs = 0;
        let mut active = vec![];
        let mut ops = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4, so traces trend upward and exercise the
            // growth paths alongside reuse and coalescing.
            if !active.is_empty() && u8::arbitrary(g) % 4 == 0 {
                ops.push(Operation::arbitrary_free(g, &mut active));
            } else {
                ops.push(Operation::arbitrary_alloc(g, &mut active, &mut num_allocs));
            }
        }

        // Drain the survivors so every trace ends on an empty heap.
        while !active.is_empty() {
            ops.push(Operation::arbitrary_free(g, &mut active));
        }

        Operations(ops)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        // Prefixes of the trace. A dangling `Free` left behind is harmless:
        // replay treats an unknown index as a no-op.
        let ops = self.0.clone();
        let prefixes = (0..self.0.len()).map(move |i| Operations(ops[..i].to_vec()));

        // The same trace with one allocation halved, or dropped once it
        // reaches zero.
        let ops = self.0.clone();
        let alloc_indices: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Alloc(_) => Some(i),
                Free(_) => None,
            })
            .collect();
        let smaller_allocs = alloc_indices.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| match *op {
                        Alloc(size) if i == j => {
                            if size == 0 {
                                None
                            } else {
                                Some(Alloc(size / 2))
                            }
                        }
                        other => Some(other),
                    })
                    .collect(),
            )
        });

        Box::new(prefixes.chain(smaller_allocs))
    }
}

impl Operations {
    /// Replay the trace against a fresh allocator, verifying the full
    /// property set after every operation.
    pub fn run(&self) {
        let alloc = TagAlloc::INIT;
        let mut slots: Vec<Option<(NonNull<u8>, usize, u8)>> = Vec::new();

        for (i, op) in self.0.iter().copied().enumerate() {
            match op {
                Alloc(0) => {
                    assert!(
                        alloc.allocate(0).is_err(),
                        "zero-size allocations return nothing"
                    );
                    slots.push(None);
                }
                Alloc(size) => {
                    let payload = alloc
                        .allocate(size)
                        .expect("the backing segment should not exhaust under test traces");
                    let addr = payload.as_ptr() as usize;
                    assert_eq!(addr % 8, 0, "payloads are 8-aligned");

                    for &(other, other_size, _) in slots.iter().flatten() {
                        let o = other.as_ptr() as usize;
                        assert!(
                            addr + size <= o || o + other_size <= addr,
                            "live payloads must not overlap"
                        );
                    }

                    let pattern = (i as u8).wrapping_mul(31).wrapping_add(7);
                    unsafe { ptr::write_bytes(payload.as_ptr(), pattern, size) };
                    slots.push(Some((payload, size, pattern)));
                }
                Free(index) => {
                    if let Some(slot) = slots.get_mut(index) {
                        if let Some((payload, size, pattern)) = slot.take() {
                            for offset in 0..size {
                                assert_eq!(
                                    unsafe { *payload.as_ptr().add(offset) },
                                    pattern,
                                    "the allocator never touches live payload bytes"
                                );
                            }
                            unsafe { alloc.free(payload) };
                        }
                    }
                }
            }

            alloc.check().expect("heap invariants hold after every operation");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ($name:ident) => {
        #[test]
        fn $name() {
            fn replay(ops: Operations) {
                ops.run();
            }

            quickcheck::QuickCheck::new()
                .tests(2)
                .quickcheck(replay as fn(Operations));
        }
    };
}

// Let the test harness run the quickchecks concurrently with each other;
// every replay gets its own allocator instance.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
run_quickchecks!(quickchecks_2);
run_quickchecks!(quickchecks_3);

////////////////////////////////////////////////////////////////////////////////

#[test]
fn regression_single_byte() {
    Operations(vec![Alloc(1)]).run();
}

#[test]
fn regression_refill_then_reuse() {
    Operations(vec![Alloc(1414), Free(0), Alloc(1414), Free(1)]).run();
}

#[test]
fn regression_zero_size_among_live_blocks() {
    Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run();
}

#[test]
fn regression_large_then_tiny() {
    Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run();
}

#[test]
fn regression_interleaved_coalescing() {
    // Frees in head, tail, middle order so coalescing runs backward,
    // forward, and both ways in one trace.
    Operations(vec![
        Alloc(64),
        Alloc(64),
        Alloc(64),
        Alloc(64),
        Free(0),
        Free(3),
        Free(1),
        Free(2),
        Alloc(200),
        Free(4),
    ])
    .run();
}

#[test]
fn allocate_size_zero_repeatedly() {
    Operations(
        std::iter::repeat(Alloc(0))
            .take(1000)
            .chain((0..1000).map(Free))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_small() {
    Operations(
        std::iter::repeat(Alloc(128))
            .take(100)
            .chain((0..100).map(Free))
            .chain(std::iter::repeat(Alloc(2048)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_large() {
    Operations(
        std::iter::repeat(Alloc(8192))
            .take(50)
            .chain((0..50).map(Free))
            .chain(std::iter::repeat(Alloc(16 * 1024)).take(50))
            .chain((0..50).map(|i| Free(i + 50)))
            .collect(),
    )
    .run();
}

////////////////////////////////////////////////////////////////////////////////

// Smoke test shape borrowed from dlmalloc-rs and adjusted to the raw
// `allocate`/`free` interface.
#[test]
fn smoke() {
    let alloc = TagAlloc::INIT;
    unsafe {
        let p = alloc.allocate(1).expect("a fresh heap can hand out a byte");
        *p.as_ptr() = 9;
        assert_eq!(*p.as_ptr(), 9);
        alloc.free(p);

        let p = alloc.allocate(1).expect("and hand it out again");
        *p.as_ptr() = 10;
        assert_eq!(*p.as_ptr(), 10);
        alloc.free(p);
    }
    alloc.check().unwrap();
}

#[test]
fn multi_threaded_smoke() {
    use std::thread;

    static SHARED: TagAlloc = TagAlloc::INIT;

    let handles: Vec<_> = (0..4)
        .map(|t: usize| {
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..400 {
                    if i % 3 == 2 {
                        if let Some(p) = live.pop() {
                            unsafe { SHARED.free(p) };
                        }
                    } else {
                        let size = 16 + (t * 8 + i) % 64;
                        live.push(SHARED.allocate(size).unwrap());
                    }
                }
                for p in live {
                    unsafe { SHARED.free(p) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    SHARED.check().unwrap();
}
