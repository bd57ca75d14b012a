//! WebAssembly backing segment.
//!
//! Linear memory can only grow, and it grows contiguously, which is exactly
//! the contract `Segment` has to provide. The segment claims the current end
//! of memory as its base on first use and commits whole 64 KiB pages as the
//! byte-granular break advances.
//!
//! Nothing else in the program may grow the memory once a segment has
//! claimed it; a foreign `memory.grow` would punch someone else's pages into
//! the middle of the heap. This is the same single-owner assumption the rest
//! of the crate already makes on this target.

use core::arch::wasm32::{memory_grow, memory_size};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use crate::const_init::ConstInit;
use crate::units::{Bytes, Pages, RoundUpTo};
use crate::AllocError;

pub(crate) const PAGE_SIZE: Bytes = Bytes(65536);

/// A contiguous, monotonically growing region at the end of linear memory.
pub(crate) struct Segment {
    base: *mut u8,
    len: usize,
    committed: usize,
}

impl ConstInit for Segment {
    const INIT: Segment = Segment {
        base: ptr::null_mut(),
        len: 0,
        committed: 0,
    };
}

impl Segment {
    /// Lowest address of the region; null until the first `grow`.
    #[inline]
    pub(crate) fn lo(&self) -> *mut u8 {
        self.base
    }

    /// Current length of the region in bytes.
    #[inline]
    pub(crate) fn len(&self) -> Bytes {
        Bytes(self.len)
    }

    /// Extend the region by exactly `delta` bytes and return the address of
    /// the first new byte.
    pub(crate) fn grow(&mut self, delta: Bytes) -> Result<NonNull<u8>, AllocError> {
        if self.base.is_null() {
            self.base = (memory_size(0) * PAGE_SIZE.0) as *mut u8;
        }

        let new_len = self.len.checked_add(delta.0).ok_or(AllocError)?;
        if new_len > self.committed {
            let shortfall: Pages = Bytes(new_len - self.committed).round_up_to();
            let previous = memory_grow(0, shortfall.0);
            if previous == usize::MAX {
                return Err(AllocError);
            }
            extra_assert_eq!(
                previous * PAGE_SIZE.0,
                self.base as usize + self.committed,
                "someone else grew the memory behind the segment's back"
            );
            self.committed += shortfall.0 * PAGE_SIZE.0;
        }

        let first_new = unsafe { self.base.add(self.len) };
        self.len = new_len;
        extra_assert!(!first_new.is_null());
        Ok(unsafe { NonNull::new_unchecked(first_new) })
    }
}

pub(crate) struct Exclusive<T> {
    inner: UnsafeCell<T>,

    #[cfg(feature = "extra_assertions")]
    in_use: core::cell::Cell<bool>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: UnsafeCell::new(T::INIT),

        #[cfg(feature = "extra_assertions")]
        in_use: core::cell::Cell::new(false),
    };
}

extra_only! {
    fn assert_not_in_use<T>(excl: &Exclusive<T>) {
        assert!(!excl.in_use.get(), "`Exclusive<T>` is not re-entrant");
    }
}

extra_only! {
    fn set_in_use<T>(excl: &Exclusive<T>) {
        excl.in_use.set(true);
    }
}

extra_only! {
    fn set_not_in_use<T>(excl: &Exclusive<T>) {
        excl.in_use.set(false);
    }
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// # Safety
    ///
    /// Wasm is single threaded, so there is no lock here; it is the caller's
    /// responsibility to ensure that `f` does not re-enter this method for
    /// the same `Exclusive` instance. Re-entry is detected under
    /// `extra_assertions`.
    #[inline]
    pub(crate) unsafe fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        assert_not_in_use(self);
        set_in_use(self);
        let result = f(&mut *self.inner.get());
        set_not_in_use(self);
        result
    }
}
