/*!

`tag_alloc`: the boundary-**tag** allocator.

A small, simple, correct heap allocator built from the classic ingredients:
boundary tags, an explicit doubly-linked free list with LIFO insertion,
first-fit placement, block splitting, and immediate bidirectional
coalescing. It services variable-size allocation requests out of one
contiguous memory region that only ever grows, acquired from a per-platform
backing segment (`mmap` reservation on unix, `VirtualAlloc` on windows,
linear memory on wasm, or a fixed static array).

`tag_alloc` is `#![no_std]` and can be installed as the global allocator:

```
use tag_alloc::TagAlloc;

#[global_allocator]
static ALLOC: TagAlloc = TagAlloc::INIT;

fn main() {
    let v: Vec<u64> = (0..100).collect();
    assert_eq!(v.len(), 100);
}
```

## Heap layout

The heap is one contiguous region. Its first word is the *head slot*,
holding the pointer to the head of the free list; its last word is the
*sentinel*, the header of an imaginary zero-size used block that lets every
forward walk stop without a bounds check. Everything in between is blocks:

```text
+-----------+---------+---------+--     --+---------+----------+
| head slot | block 0 | block 1 |   ...   | block k | sentinel |
+-----------+---------+---------+--     --+---------+----------+
```

Each block carries its size and two flag bits in its header word; free
blocks mirror the header into a footer word and thread the free list's
links through their first two payload words. Used blocks have no footer
(those bytes are payload), which is why each header also records whether
the *preceding* block is used: the footer walk backwards is only taken when
the preceding block is free, which is exactly when its footer exists. See
the `block` module for the full picture.

## Cargo features

- **extra_assertions**: Enable various extra, expensive integrity
  assertions and defensive mechanisms, such as poisoning freed memory and
  re-verifying every heap invariant after each operation. Large runtime
  overhead; useful when debugging a use-after-free or `tag_alloc` itself.

- **static_array_backend**: Force the use of an OS-independent backing
  segment with a maximum size fixed at compile time. Suitable for targets
  with no memory-mapping interface at all.

## Implementation notes and constraints

- Allocation is first-fit over the free list, *O(free blocks)*. Freeing,
  including coalescing, is *O(1)*: by the no-adjacent-free-blocks
  invariant, a coalesce touches at most one neighbor on each side.

- Payloads are aligned to 8 bytes, and that is the strongest alignment
  available: `GlobalAlloc` requests with a larger alignment return null.

- Each used block costs one word of overhead; the minimum block is four
  words.

- Freed memory is never returned to the operating system. The backing
  segment only grows, and freed blocks are kept on the free list for
  reuse.

*/

#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod extra_assert;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        mod imp_static_array;
        pub(crate) use imp_static_array as imp;
    } else if #[cfg(target_arch = "wasm32")] {
        mod imp_wasm32;
        pub(crate) use imp_wasm32 as imp;
    } else if #[cfg(unix)] {
        mod imp_unix;
        pub(crate) use imp_unix as imp;
    } else if #[cfg(windows)] {
        mod imp_windows;
        pub(crate) use imp_windows as imp;
    } else {
        compile_error! {
            "no backing segment for this target; the `static_array_backend` feature works anywhere"
        }
    }
}

mod block;
mod const_init;
mod free_list;
mod units;

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use block::{
    assert_free_pattern, write_free_pattern, BoundaryTag, FreeBlock, ALIGN, MIN_BLOCK_SIZE,
    TAG_PREV_USED, TAG_USED, WORD_SIZE,
};
use const_init::ConstInit;
use free_list::FreeList;
use units::{align_up, Bytes, Pages, RoundUpTo};

/// The error returned when an allocation cannot be satisfied: the request
/// was zero bytes, over-aligned, or the backing segment is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("tag_alloc: allocation failed")
    }
}

/// A heap-consistency violation found by [`TagAlloc::check`].
///
/// Offsets are in bytes from the low end of the heap. Only the first
/// violation encountered is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// A block's size is not a multiple of the alignment, is below the
    /// minimum block size, or runs past the end of the heap.
    BadBlockSize {
        /// Where the offending block starts.
        offset: usize,
    },
    /// A header's `PREV_USED` flag disagrees with the used flag of the
    /// block preceding it in memory.
    PrevUsedMismatch {
        /// Where the offending block starts.
        offset: usize,
    },
    /// A free block's footer does not mirror its header.
    FooterMismatch {
        /// Where the offending block starts.
        offset: usize,
    },
    /// Two free blocks are adjacent in memory; coalescing should have
    /// merged them.
    AdjacentFreeBlocks {
        /// Where the second of the two blocks starts.
        offset: usize,
    },
    /// The end-of-heap sentinel is no longer a zero-size used block, or the
    /// blocks do not tile the region between head slot and sentinel.
    BadSentinel,
    /// The free list is structurally broken: a cycle, an entry outside the
    /// heap, an entry marked used, or inconsistent `next`/`prev` links.
    FreeListCorrupt {
        /// Where the offending entry starts, if it lies inside the heap.
        offset: usize,
    },
    /// The free list and the heap disagree about how many free blocks
    /// exist.
    FreeBlockCountMismatch {
        /// Free blocks found walking the heap.
        in_heap: usize,
        /// Entries found walking the free list.
        in_list: usize,
    },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CheckError::BadBlockSize { offset } => {
                write!(f, "bad block size at heap offset {}", offset)
            }
            CheckError::PrevUsedMismatch { offset } => {
                write!(f, "PREV_USED flag wrong at heap offset {}", offset)
            }
            CheckError::FooterMismatch { offset } => {
                write!(f, "free block footer differs from header at heap offset {}", offset)
            }
            CheckError::AdjacentFreeBlocks { offset } => {
                write!(f, "uncoalesced adjacent free blocks at heap offset {}", offset)
            }
            CheckError::BadSentinel => f.write_str("end-of-heap sentinel clobbered"),
            CheckError::FreeListCorrupt { offset } => {
                write!(f, "free list corrupt near heap offset {}", offset)
            }
            CheckError::FreeBlockCountMismatch { in_heap, in_list } => write!(
                f,
                "heap has {} free blocks but the free list has {}",
                in_heap, in_list
            ),
        }
    }
}

/// The allocation engine: a backing segment interpreted as the heap layout
/// described in the crate docs.
///
/// All metadata lives inside the segment itself; this struct is just the
/// segment handle.
struct Heap {
    seg: imp::Segment,
}

impl ConstInit for Heap {
    const INIT: Heap = Heap {
        seg: imp::Segment::INIT,
    };
}

impl Heap {
    fn initialized(&self) -> bool {
        self.seg.len().0 != 0
    }

    /// The free list rooted in the heap's first word. The heap must be
    /// initialized.
    fn free_list(&self) -> FreeList {
        extra_assert!(self.initialized());
        unsafe { FreeList::from_head_slot(NonNull::new_unchecked(self.seg.lo())) }
    }

    /// Map the initial region: head slot, one minimum-size free block, and
    /// the sentinel. Idempotent.
    fn init(&mut self) -> Result<(), AllocError> {
        if self.initialized() {
            return Ok(());
        }

        let init_size = WORD_SIZE + MIN_BLOCK_SIZE + WORD_SIZE;
        let base = self.seg.grow(init_size)?;
        extra_assert_eq!(base.as_ptr(), self.seg.lo(), "the first growth maps the segment");

        unsafe {
            // The first block has nothing before it; treat that as used so
            // nothing ever walks off the low end.
            let first = FreeBlock::from_uninitialized(
                NonNull::new_unchecked(base.as_ptr().add(WORD_SIZE.0)),
                MIN_BLOCK_SIZE,
                TAG_PREV_USED,
            );
            extra_assert_eq!(
                first.header.payload().as_ptr() as usize % ALIGN.0,
                0,
                "payloads fall on the alignment from a word-size head slot"
            );

            BoundaryTag::from_raw(base.as_ptr().add((init_size - WORD_SIZE).0))
                .write(Bytes(0), TAG_USED);

            let list = self.free_list();
            list.init_empty();
            list.insert(first);
        }

        assert_heap_consistent(self);
        Ok(())
    }

    /// Allocate `size` payload bytes and return the payload address.
    fn allocate(&mut self, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        if size.0 == 0 {
            // Zero-size requests get nothing, by contract.
            return Err(AllocError);
        }
        self.init()?;

        // One word on top of the payload for the header; no footer, because
        // used blocks don't keep one.
        let req = size
            .0
            .checked_add(WORD_SIZE.0)
            .map(Bytes)
            .and_then(|n| align_up(n, ALIGN))
            .ok_or(AllocError)?;
        let req = cmp::max(MIN_BLOCK_SIZE, req);

        let list = self.free_list();
        let mut found = list.first_fit(req);
        if found.is_none() {
            self.grow_heap(req)?;
            // The fresh (coalesced) block is at least `req` bytes, so the
            // rescan cannot miss.
            found = list.first_fit(req);
        }
        let block = found.ok_or(AllocError)?;

        unsafe {
            assert_free_pattern(block);
            list.unlink(block);

            let full = block.header.size();
            let prev_tag = block.header.prev_used_tag();

            if full - req >= MIN_BLOCK_SIZE {
                // Split: the used prefix keeps the inherited PREV_USED; the
                // free suffix is preceded by the now-used prefix.
                block.header.write(req, prev_tag | TAG_USED);
                let suffix = FreeBlock::from_uninitialized(
                    NonNull::new_unchecked(block.header.raw().add(req.0) as *mut u8),
                    full - req,
                    TAG_PREV_USED,
                );
                list.insert(suffix);
            } else {
                // The whole block goes out; its follower (sentinel included)
                // is now preceded by a used block.
                block.header.set_used();
                block.header.following().set_prev_used();
            }

            assert_heap_consistent(self);
            Ok(block.header.payload())
        }
    }

    /// Release a payload previously returned by [`Heap::allocate`].
    ///
    /// # Safety
    ///
    /// `payload` must come from this heap and must not have been freed
    /// since; double-frees and foreign pointers are undefined behavior.
    unsafe fn free(&mut self, payload: NonNull<u8>) {
        let header = BoundaryTag::from_payload(payload);
        extra_assert!(header.is_used(), "double free, or pointer from elsewhere");

        header.clear_used();
        header.write_footer();
        header.following().clear_prev_used();

        let block = header.as_free_block_unchecked();
        write_free_pattern(block);
        self.free_list().insert(block);
        self.coalesce(block);

        assert_heap_consistent(self);
    }

    /// Merge `block`, already on the free list, with any adjacent free
    /// blocks in both directions.
    unsafe fn coalesce(&mut self, block: &FreeBlock) {
        let list = self.free_list();
        let old_size = block.header.size();
        let mut new_size = old_size;

        // Absorb memory-preceding free blocks; each footer tells us where
        // that block starts.
        let mut merged: &BoundaryTag = &block.header;
        while !merged.is_prev_used() {
            let preceding = merged.preceding_free();
            list.unlink(preceding);
            new_size += preceding.header.size();
            merged = &preceding.header;
        }

        // Absorb memory-following free blocks; the sentinel's used flag
        // terminates the walk.
        let mut after = block.header.following();
        while !after.is_used() {
            list.unlink(after.as_free_block_unchecked());
            new_size += after.size();
            after = after.following();
        }

        if new_size != old_size {
            // Replace the original entry with the merged block, at the head:
            // the LIFO discipline carries over to the combined block. The
            // block preceding the merged one must be used, or the backward
            // pass would have absorbed it.
            list.unlink(block);
            merged.write(new_size, TAG_PREV_USED);
            merged.write_footer();
            let merged = merged.as_free_block_unchecked();
            write_free_pattern(merged);
            list.insert(merged);
        }
    }

    /// Extend the heap by whole pages, at least `req` bytes, and hand the
    /// new region to the free list.
    fn grow_heap(&mut self, req: Bytes) -> Result<(), AllocError> {
        let pages: Pages = req.round_up_to();
        let total = Bytes(pages.0.checked_mul(imp::PAGE_SIZE.0).ok_or(AllocError)?);
        let base = self.seg.grow(total)?;

        unsafe {
            // The old sentinel word becomes the new block's header, so the
            // block starts one word before the newly grown region and
            // inherits the sentinel's PREV_USED flag.
            let start = base.as_ptr().sub(WORD_SIZE.0);
            let prev_tag = {
                let old_sentinel = BoundaryTag::from_raw(start);
                extra_assert_eq!(old_sentinel.size().0, 0);
                extra_assert!(old_sentinel.is_used());
                old_sentinel.prev_used_tag()
            };

            let fresh =
                FreeBlock::from_uninitialized(NonNull::new_unchecked(start), total, prev_tag);
            BoundaryTag::from_raw(start.add(total.0)).write(Bytes(0), TAG_USED);

            self.free_list().insert(fresh);
            // Merges with the previously-final block if that one is free.
            self.coalesce(fresh);
        }
        Ok(())
    }

    /// Walk the real blocks in address order. The heap must be initialized
    /// and consistent.
    fn blocks(&self) -> Blocks<'_> {
        extra_assert!(self.initialized());
        Blocks {
            cursor: unsafe { self.seg.lo().add(WORD_SIZE.0) as *const u8 },
            _heap: PhantomData,
        }
    }

    /// Verify every heap invariant; see [`TagAlloc::check`].
    fn check(&self) -> Result<(), CheckError> {
        if !self.initialized() {
            return Ok(());
        }

        let lo = self.seg.lo() as usize;
        let len = self.seg.len().0;
        let word = WORD_SIZE.0;

        let mut offset = word;
        let mut prev_used = true;
        let mut free_in_heap = 0usize;

        // Pass 1: tile the heap from the first block to the sentinel.
        unsafe {
            loop {
                if offset + word > len {
                    return Err(CheckError::BadSentinel);
                }
                let tag = BoundaryTag::from_raw((lo + offset) as *const u8);
                let size = tag.size().0;

                if size == 0 {
                    if !tag.is_used() {
                        return Err(CheckError::BadSentinel);
                    }
                    if tag.is_prev_used() != prev_used {
                        return Err(CheckError::PrevUsedMismatch { offset });
                    }
                    if offset + word != len {
                        return Err(CheckError::BadSentinel);
                    }
                    break;
                }

                if size % ALIGN.0 != 0 || size < MIN_BLOCK_SIZE.0 || offset + size + word > len {
                    return Err(CheckError::BadBlockSize { offset });
                }
                if tag.is_prev_used() != prev_used {
                    return Err(CheckError::PrevUsedMismatch { offset });
                }
                if !tag.is_used() {
                    if !prev_used {
                        return Err(CheckError::AdjacentFreeBlocks { offset });
                    }
                    if tag.footer().word() != tag.word() {
                        return Err(CheckError::FooterMismatch { offset });
                    }
                    free_in_heap += 1;
                }

                prev_used = tag.is_used();
                offset += size;
            }
        }

        // Pass 2: the free list must be exactly the free blocks, well
        // linked. Every entry is bounds-checked before it is read, so a
        // pointer that escaped the heap is reported instead of chased.
        unsafe {
            let list = self.free_list();
            let mut in_list = 0usize;
            let mut cursor = list.head();
            while !cursor.is_null() {
                let addr = cursor as usize;
                let offset = addr.wrapping_sub(lo);
                if in_list >= free_in_heap {
                    // More entries than free blocks: a cycle, or foreigners.
                    return Err(CheckError::FreeListCorrupt { offset });
                }
                if addr % word != 0
                    || addr < lo + word
                    || addr + MIN_BLOCK_SIZE.0 + word > lo + len
                {
                    return Err(CheckError::FreeListCorrupt { offset });
                }

                let entry = &*cursor;
                if entry.header.is_used() {
                    return Err(CheckError::FreeListCorrupt { offset });
                }
                if in_list == 0 && !entry.prev_free().is_null() {
                    // The head has no previous entry.
                    return Err(CheckError::FreeListCorrupt { offset });
                }
                let next = entry.next_free();
                if !next.is_null() && (next as usize) >= lo + word && (next as usize) < lo + len {
                    if (*next).prev_free() != cursor {
                        return Err(CheckError::FreeListCorrupt { offset });
                    }
                }
                in_list += 1;
                cursor = next;
            }

            if in_list != free_in_heap {
                return Err(CheckError::FreeBlockCountMismatch {
                    in_heap: free_in_heap,
                    in_list,
                });
            }
        }

        Ok(())
    }
}

/// Address-order block walk; stops at the sentinel.
struct Blocks<'a> {
    cursor: *const u8,
    _heap: PhantomData<&'a Heap>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a BoundaryTag;

    fn next(&mut self) -> Option<&'a BoundaryTag> {
        let tag = unsafe { BoundaryTag::from_raw(self.cursor) };
        if tag.size().0 == 0 {
            return None;
        }
        self.cursor = unsafe { self.cursor.add(tag.size().0) };
        Some(tag)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.initialized() {
            return f.write_str("Heap { unmapped }");
        }

        let lo = self.seg.lo() as usize;
        writeln!(
            f,
            "Heap {{ len: {}, free list head: {:p} }}",
            self.seg.len().0,
            self.free_list().head()
        )?;
        for tag in self.blocks() {
            let offset = tag.raw() as usize - lo;
            match tag.as_free_block() {
                Some(free) => writeln!(
                    f,
                    "  {:>10} {:>10}  FREE  prev_used={} next={:p} prev={:p}",
                    offset,
                    tag.size().0,
                    tag.is_prev_used() as u8,
                    free.next_free(),
                    free.prev_free(),
                )?,
                None => writeln!(
                    f,
                    "  {:>10} {:>10}  USED  prev_used={}",
                    offset,
                    tag.size().0,
                    tag.is_prev_used() as u8,
                )?,
            }
        }
        write!(f, "  end of heap")
    }
}

extra_only! {
    fn assert_heap_consistent(heap: &Heap) {
        if let Err(violation) = heap.check() {
            panic!("heap invariant violated: {}", violation);
        }
    }
}

/// A boundary-tag allocator.
///
/// Usable as a `#[global_allocator]`; see the crate docs. All methods take
/// `&self` and serialize through an internal platform mutex, so a shared
/// `static` instance is fine.
///
/// The strongest alignment `TagAlloc` can provide is 8 bytes. As a
/// `GlobalAlloc` it reports over-aligned requests as allocation failure
/// (null), so it should only be installed globally for programs whose
/// allocations stay within that (this covers the common collection and
/// string types).
pub struct TagAlloc {
    heap: imp::Exclusive<Heap>,
}

unsafe impl Sync for TagAlloc {}

impl ConstInit for TagAlloc {
    const INIT: TagAlloc = TagAlloc {
        heap: imp::Exclusive::INIT,
    };
}

impl TagAlloc {
    /// An initial `const` default construction of a `TagAlloc`.
    ///
    /// Usable for initializing `static`s that get set as the global
    /// allocator.
    pub const INIT: Self = <Self as ConstInit>::INIT;

    /// Map the heap's initial region.
    ///
    /// Calling this is optional and idempotent; the first
    /// [`allocate`](TagAlloc::allocate) does it lazily. It exists so
    /// exhaustion of the backing store can be observed up front.
    pub fn init(&self) -> Result<(), AllocError> {
        unsafe { self.heap.with_exclusive_access(|heap| heap.init()) }
    }

    /// Allocate `size` bytes and return the payload address, aligned to 8
    /// bytes.
    ///
    /// A zero `size` returns `Err(AllocError)` with no effect on the heap,
    /// as does exhaustion of the backing segment.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        unsafe {
            self.heap
                .with_exclusive_access(|heap| heap.allocate(Bytes(size)))
        }
    }

    /// Release a payload previously returned by
    /// [`allocate`](TagAlloc::allocate).
    ///
    /// The freed block is put at the head of the free list and immediately
    /// merged with any free neighbors.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `allocate` on this same
    /// instance and must not have been freed since. Double-frees and
    /// foreign pointers are undefined behavior.
    pub unsafe fn free(&self, payload: NonNull<u8>) {
        self.heap
            .with_exclusive_access(|heap| unsafe { heap.free(payload) })
    }

    /// Verify every heap invariant: block sizing and tiling, flag
    /// consistency, footer mirroring, the no-adjacent-free-blocks rule, the
    /// sentinel, and free-list shape.
    ///
    /// Returns the first violation found. A heap that has never been
    /// touched passes vacuously. This is a diagnostic; the allocation paths
    /// assume the invariants hold rather than re-checking them (unless the
    /// `extra_assertions` feature is on, which runs this after every
    /// operation).
    pub fn check(&self) -> Result<(), CheckError> {
        unsafe { self.heap.with_exclusive_access(|heap| heap.check()) }
    }
}

unsafe impl GlobalAlloc for TagAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            // Ensure the made-up pointer for a zero-size allocation is
            // properly aligned, by using the alignment as the address.
            return layout.align() as *mut u8;
        }
        if layout.align() > ALIGN.0 {
            // 8 bytes is the best this layout can do.
            return ptr::null_mut();
        }
        match self.allocate(layout.size()) {
            Ok(payload) => payload.as_ptr(),
            Err(AllocError) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            // Zero-size allocations were never backed by a block.
            return;
        }
        if let Some(payload) = NonNull::new(ptr) {
            extra_assert!(
                unsafe { BoundaryTag::from_payload(payload) }.size().0 > layout.size(),
                "layout larger than the block being freed"
            );
            self.free(payload);
        }
    }
}
