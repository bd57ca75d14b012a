//! Windows backing segment and mutual exclusion.
//!
//! `VirtualAlloc` separates reserving address space from committing pages,
//! which maps directly onto what `Segment` needs: one fixed-capacity
//! reservation up front keeps the region contiguous, and `grow` commits the
//! pages the advancing break touches. Committing an already-committed page
//! is documented to be fine, so byte-granular growth needs no bookkeeping
//! beyond the break itself.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use winapi::shared::ntdef::NULL;
use winapi::um::memoryapi::VirtualAlloc;
use winapi::um::synchapi::{
    AcquireSRWLockExclusive, ReleaseSRWLockExclusive, SRWLOCK, SRWLOCK_INIT,
};
use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

use crate::const_init::ConstInit;
use crate::units::Bytes;
use crate::AllocError;

pub(crate) const PAGE_SIZE: Bytes = Bytes(4096);

/// Address space reserved per segment. Growing past this fails the
/// allocation; it is never resized.
const SEGMENT_CAPACITY: Bytes = Bytes(256 * 1024 * 1024);

/// A contiguous, monotonically growing memory region inside one
/// `MEM_RESERVE` reservation.
pub(crate) struct Segment {
    base: *mut u8,
    len: usize,
}

impl ConstInit for Segment {
    const INIT: Segment = Segment {
        base: ptr::null_mut(),
        len: 0,
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
            let addr =
                unsafe { VirtualAlloc(NULL, SEGMENT_CAPACITY.0, MEM_RESERVE, PAGE_NOACCESS) };
            if addr.is_null() {
                return Err(AllocError);
            }
            self.base = addr as *mut u8;
        }

        if delta.0 > SEGMENT_CAPACITY.0 - self.len {
            return Err(AllocError);
        }

        let first_new = unsafe { self.base.add(self.len) };
        let committed = unsafe {
            VirtualAlloc(first_new as *mut _, delta.0, MEM_COMMIT, PAGE_READWRITE)
        };
        if committed.is_null() {
            return Err(AllocError);
        }

        self.len += delta.0;
        extra_assert!(!first_new.is_null());
        Ok(unsafe { NonNull::new_unchecked(first_new) })
    }
}

// Align to the cache line size to avoid false sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    lock: UnsafeCell<SRWLOCK>,
    inner: UnsafeCell<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        lock: UnsafeCell::new(SRWLOCK_INIT),
        inner: UnsafeCell::new(T::INIT),
    };
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// # Safety
    ///
    /// `f` must not re-enter this method for the same `Exclusive` instance;
    /// SRW locks are not recursive.
    #[inline]
    pub(crate) unsafe fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        AcquireSRWLockExclusive(self.lock.get());

        let result = f(&mut *self.inner.get());

        ReleaseSRWLockExclusive(self.lock.get());

        result
    }
}
