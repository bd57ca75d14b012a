//! Block layout and boundary-tag arithmetic.
//!
//! Every block in the heap begins with one *boundary tag*: a word encoding
//! `size | tags`, where the size occupies the bits above the alignment and
//! the low bits carry flags. Free blocks additionally end with a footer word
//! mirroring the header, and thread the free list's `next`/`prev` links
//! through the first two payload words:
//!
//! ```text
//!  USED: +----------------+   FREE: +----------------+
//!        |     header     |         |     header     |
//!        +----------------+         +----------------+
//!        |  payload and   |         |    next ptr    |
//!        |    padding     |         +----------------+
//!        |       .        |         |    prev ptr    |
//!        |       .        |         +----------------+
//!        |       .        |         |   free space   |
//!        |                |         +----------------+
//!        |                |         |     footer     |
//!        +----------------+         +----------------+
//! ```
//!
//! Used blocks have no footer, so the only way to find the start of the
//! block preceding you in memory is through its footer, which exists
//! exactly when that block is free, which is exactly when coalescing needs
//! it. The `PREV_USED` tag tells you whether looking is safe.
//!
//! This module is the narrow unsafe core: everything here is O(1) address
//! arithmetic over raw heap words, governed by contracts that the allocation
//! engine upholds and that are *not* runtime-checked (beyond
//! `extra_assertions`). Misuse is undefined behavior.

use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use crate::units::Bytes;

/// Alignment of every block size and every payload pointer.
pub(crate) const ALIGN: Bytes = Bytes(8);

/// One machine word; headers, footers, and free-list links are all one word.
pub(crate) const WORD_SIZE: Bytes = Bytes(mem::size_of::<usize>());

/// Tag bit 0: this block is allocated.
pub(crate) const TAG_USED: usize = 0b01;

/// Tag bit 1: the block immediately preceding this one in memory is
/// allocated.
pub(crate) const TAG_PREV_USED: usize = 0b10;

const TAG_MASK: usize = ALIGN.0 - 1;
const SIZE_MASK: usize = !TAG_MASK;

/// The smallest block we ever carve: header, the two free-list links, and a
/// footer, rounded up to the alignment. Anything smaller could not be freed.
pub(crate) const MIN_BLOCK_SIZE: Bytes =
    Bytes((mem::size_of::<FreeBlock>() + mem::size_of::<usize>() + TAG_MASK) & SIZE_MASK);

/// A boundary tag, viewed in place inside the heap.
///
/// The same word format serves as header (every block) and footer (free
/// blocks only). The address of a block's header *is* the address of the
/// block.
#[repr(transparent)]
pub(crate) struct BoundaryTag {
    size_and_tags: Cell<usize>,
}

#[test]
fn boundary_tag_layout() {
    assert_eq!(
        mem::size_of::<BoundaryTag>(),
        mem::size_of::<usize>(),
        "a boundary tag must be exactly one word"
    );
}

#[test]
fn tags_fit_below_the_alignment() {
    assert_eq!(
        (TAG_USED | TAG_PREV_USED) & SIZE_MASK,
        0,
        "block sizes and tag bits may not overlap"
    );
}

impl BoundaryTag {
    /// View the word at `word` as a boundary tag.
    #[inline]
    pub(crate) unsafe fn from_raw<'a>(word: *const u8) -> &'a BoundaryTag {
        extra_assert_eq!(word as usize % WORD_SIZE.0, 0);
        &*(word as *const BoundaryTag)
    }

    /// Recover a block header from the payload pointer handed to the caller.
    #[inline]
    pub(crate) unsafe fn from_payload<'a>(payload: NonNull<u8>) -> &'a BoundaryTag {
        BoundaryTag::from_raw(payload.as_ptr().sub(WORD_SIZE.0))
    }

    /// The address of this tag, which for a header is the block's address.
    #[inline]
    pub(crate) fn raw(&self) -> *const u8 {
        self as *const BoundaryTag as *const u8
    }

    #[inline]
    pub(crate) fn word(&self) -> usize {
        self.size_and_tags.get()
    }

    #[inline]
    pub(crate) fn size(&self) -> Bytes {
        Bytes(self.word() & SIZE_MASK)
    }

    #[inline]
    pub(crate) fn is_used(&self) -> bool {
        self.word() & TAG_USED != 0
    }

    #[inline]
    pub(crate) fn is_prev_used(&self) -> bool {
        self.word() & TAG_PREV_USED != 0
    }

    /// This tag's `PREV_USED` bit, isolated, for re-packing into a rewritten
    /// header.
    #[inline]
    pub(crate) fn prev_used_tag(&self) -> usize {
        self.word() & TAG_PREV_USED
    }

    #[inline]
    pub(crate) fn set_used(&self) {
        self.size_and_tags.set(self.word() | TAG_USED);
    }

    #[inline]
    pub(crate) fn clear_used(&self) {
        self.size_and_tags.set(self.word() & !TAG_USED);
    }

    #[inline]
    pub(crate) fn set_prev_used(&self) {
        self.size_and_tags.set(self.word() | TAG_PREV_USED);
    }

    #[inline]
    pub(crate) fn clear_prev_used(&self) {
        self.size_and_tags.set(self.word() & !TAG_PREV_USED);
    }

    /// Overwrite the whole tag with `size | tags`.
    #[inline]
    pub(crate) fn write(&self, size: Bytes, tags: usize) {
        extra_assert_eq!(size.0 & TAG_MASK, 0, "block sizes are aligned");
        extra_assert_eq!(tags & SIZE_MASK, 0, "tags live below the alignment");
        self.size_and_tags.set(size.0 | tags);
    }

    /// The first payload byte of the block headed by this tag.
    #[inline]
    pub(crate) fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.raw().add(WORD_SIZE.0) as *mut u8) }
    }

    /// The header of the block immediately following this one in memory.
    ///
    /// Always a readable word: the end-of-heap sentinel guarantees the walk
    /// off the last real block lands on a used, zero-size tag.
    #[inline]
    pub(crate) unsafe fn following<'a>(&self) -> &'a BoundaryTag {
        extra_assert!(self.size().0 != 0, "cannot step past the sentinel");
        BoundaryTag::from_raw(self.raw().add(self.size().0))
    }

    /// This block's footer word. Meaningful only while the block is free.
    #[inline]
    pub(crate) unsafe fn footer<'a>(&self) -> &'a BoundaryTag {
        BoundaryTag::from_raw(self.raw().add((self.size() - WORD_SIZE).0))
    }

    /// Mirror the header into the footer.
    #[inline]
    pub(crate) unsafe fn write_footer(&self) {
        self.footer().size_and_tags.set(self.word());
    }

    /// The free block immediately preceding this one in memory, located
    /// through its footer.
    ///
    /// Defined only when `!self.is_prev_used()`; a used predecessor has no
    /// footer and the word read here would be its payload.
    #[inline]
    pub(crate) unsafe fn preceding_free<'a>(&self) -> &'a FreeBlock {
        extra_assert!(!self.is_prev_used());
        let footer = BoundaryTag::from_raw(self.raw().sub(WORD_SIZE.0));
        let size = footer.size();
        extra_assert!(size >= MIN_BLOCK_SIZE);
        &*(self.raw().sub(size.0) as *const FreeBlock)
    }

    /// View this block as a free block, if its used tag is clear.
    #[inline]
    pub(crate) fn as_free_block(&self) -> Option<&FreeBlock> {
        if self.is_used() {
            None
        } else {
            Some(unsafe { &*(self.raw() as *const FreeBlock) })
        }
    }

    /// View this block as a free block without checking the used tag.
    #[inline]
    pub(crate) unsafe fn as_free_block_unchecked(&self) -> &FreeBlock {
        extra_assert!(!self.is_used());
        &*(self.raw() as *const FreeBlock)
    }
}

/// A free block, viewed in place: the header plus the two free-list links
/// threaded through what would otherwise be payload.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub(crate) header: BoundaryTag,
    next_free: Cell<*const FreeBlock>,
    prev_free: Cell<*const FreeBlock>,
}

#[test]
fn free_block_layout() {
    assert_eq!(
        mem::size_of::<FreeBlock>(),
        3 * mem::size_of::<usize>(),
        "correctness depends on FreeBlock being header plus two link words"
    );
    assert_eq!(mem::align_of::<FreeBlock>(), mem::align_of::<usize>());
    assert_eq!(MIN_BLOCK_SIZE.0 % ALIGN.0, 0);
    assert!(MIN_BLOCK_SIZE.0 >= mem::size_of::<FreeBlock>() + mem::size_of::<usize>());
}

impl FreeBlock {
    /// Stamp a fresh free block over `raw`: header word `size | tags`, null
    /// links, mirrored footer.
    pub(crate) unsafe fn from_uninitialized<'a>(
        raw: NonNull<u8>,
        size: Bytes,
        tags: usize,
    ) -> &'a FreeBlock {
        extra_assert_eq!(raw.as_ptr() as usize % WORD_SIZE.0, 0);
        extra_assert_eq!(tags & TAG_USED, 0, "a free block cannot carry the used tag");
        extra_assert!(size >= MIN_BLOCK_SIZE);

        let block = raw.as_ptr() as *mut FreeBlock;
        ptr::write(
            block,
            FreeBlock {
                header: BoundaryTag {
                    size_and_tags: Cell::new(size.0 | tags),
                },
                next_free: Cell::new(ptr::null()),
                prev_free: Cell::new(ptr::null()),
            },
        );

        let block = &*block;
        block.header.write_footer();
        write_free_pattern(block);
        block
    }

    #[inline]
    pub(crate) fn next_free(&self) -> *const FreeBlock {
        self.next_free.get()
    }

    #[inline]
    pub(crate) fn set_next_free(&self, next: *const FreeBlock) {
        self.next_free.set(next);
    }

    #[inline]
    pub(crate) fn prev_free(&self) -> *const FreeBlock {
        self.prev_free.get()
    }

    #[inline]
    pub(crate) fn set_prev_free(&self, prev: *const FreeBlock) {
        self.prev_free.set(prev);
    }
}

// Whenever a block enters the free list, its bytes between the links and the
// footer are overwritten with this pattern, and the pattern is re-verified
// when the block is handed back out. Unexpected `0x5a5a5a5a` values in user
// data mean either (a) a use-after-free in the caller, or (b) a bug in
// `tag_alloc`.
#[cfg(feature = "extra_assertions")]
const FREE_PATTERN: u8 = 0x5a;

#[cfg(feature = "extra_assertions")]
fn pattern_len(block: &FreeBlock) -> usize {
    block.header.size().0 - mem::size_of::<FreeBlock>() - WORD_SIZE.0
}

extra_only! {
    pub(crate) fn write_free_pattern(block: &FreeBlock) {
        unsafe {
            let tail = block.header.raw().add(mem::size_of::<FreeBlock>()) as *mut u8;
            ptr::write_bytes(tail, FREE_PATTERN, pattern_len(block));
        }
    }
}

extra_only! {
    pub(crate) fn assert_free_pattern(block: &FreeBlock) {
        unsafe {
            let tail = block.header.raw().add(mem::size_of::<FreeBlock>());
            let tail = core::slice::from_raw_parts(tail, pattern_len(block));
            assert!(
                tail.iter().all(|byte| *byte == FREE_PATTERN),
                "freed memory was overwritten while on the free list"
            );
        }
    }
}
