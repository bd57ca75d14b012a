//! Unix backing segment and mutual exclusion.
//!
//! The allocation engine needs its region to be contiguous and to only ever
//! grow, so per-call `mmap` is not an option: the kernel hands out unrelated
//! addresses. Instead one fixed-capacity anonymous mapping is reserved up
//! front and `grow` bumps a break inside it. Pages are committed lazily by
//! the OS on first touch, so the large reservation costs address space, not
//! memory.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use crate::const_init::ConstInit;
use crate::units::Bytes;
use crate::AllocError;

pub(crate) const PAGE_SIZE: Bytes = Bytes(4096);

/// Address space reserved per segment. Growing past this fails the
/// allocation; it is never resized.
const SEGMENT_CAPACITY: Bytes = Bytes(256 * 1024 * 1024);

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE;

/// A contiguous, monotonically growing memory region.
///
/// `lo` is stable from the first successful `grow` on; the mapping is never
/// returned to the OS.
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
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    SEGMENT_CAPACITY.0,
                    libc::PROT_READ | libc::PROT_WRITE,
                    MAP_FLAGS,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(AllocError);
            }
            self.base = addr as *mut u8;
        }

        if delta.0 > SEGMENT_CAPACITY.0 - self.len {
            return Err(AllocError);
        }

        let first_new = unsafe { self.base.add(self.len) };
        self.len += delta.0;
        extra_assert!(!first_new.is_null());
        Ok(unsafe { NonNull::new_unchecked(first_new) })
    }
}

// Align to the cache line size to avoid false sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    lock: UnsafeCell<libc::pthread_mutex_t>,
    inner: UnsafeCell<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        lock: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        inner: UnsafeCell::new(T::INIT),
    };
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// # Safety
    ///
    /// `f` must not re-enter this method for the same `Exclusive` instance;
    /// the mutex is not recursive. The `pthread` return codes are only
    /// checked under `extra_assertions`.
    #[inline]
    pub(crate) unsafe fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let code = libc::pthread_mutex_lock(self.lock.get());
        extra_assert_eq!(code, 0, "pthread_mutex_lock should run OK");

        let result = f(&mut *self.inner.get());

        let code = libc::pthread_mutex_unlock(self.lock.get());
        extra_assert_eq!(code, 0, "pthread_mutex_unlock should run OK");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_is_contiguous_and_monotonic() {
        let mut seg = Segment::INIT;
        assert!(seg.lo().is_null());
        assert_eq!(seg.len(), Bytes(0));

        let first = seg.grow(Bytes(48)).unwrap();
        assert_eq!(first.as_ptr(), seg.lo());
        assert_eq!(seg.lo() as usize % PAGE_SIZE.0, 0, "mappings are page-aligned");

        let lo = seg.lo();
        let second = seg.grow(Bytes(4096)).unwrap();
        assert_eq!(second.as_ptr(), unsafe { lo.add(48) });
        assert_eq!(seg.lo(), lo, "the base never moves");
        assert_eq!(seg.len(), Bytes(48 + 4096));

        // The whole grown region is writable.
        unsafe { ptr::write_bytes(first.as_ptr(), 0xab, 48 + 4096) };
    }

    #[test]
    fn grow_past_capacity_fails() {
        let mut seg = Segment::INIT;
        seg.grow(Bytes(PAGE_SIZE.0)).unwrap();
        assert_eq!(seg.grow(Bytes(usize::MAX / 2)), Err(AllocError));
        // The failed call must not have moved the break.
        assert_eq!(seg.len(), Bytes(PAGE_SIZE.0));
    }
}
