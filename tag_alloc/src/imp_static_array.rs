//! OS-independent backing segment: a fixed scratch array in the binary
//! image, and `spin`-based mutual exclusion.
//!
//! Exactly one segment can claim the scratch array; the claim is guarded by
//! a spin lock so racing `TagAlloc` instances cannot end up interleaved
//! inside it (an interleaved segment could not stay contiguous).

use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::const_init::ConstInit;
use crate::units::Bytes;
use crate::AllocError;

pub(crate) const PAGE_SIZE: Bytes = Bytes(4096);

const SCRATCH_LEN_BYTES: usize = 32 * 1024 * 1024;

#[repr(align(4096))]
struct ScratchHeap([u8; SCRATCH_LEN_BYTES]);

static mut SCRATCH_HEAP: ScratchHeap = ScratchHeap([0; SCRATCH_LEN_BYTES]);
static SCRATCH_CLAIMED: Mutex<bool> = Mutex::new(false);

/// A contiguous, monotonically growing region carved out of the scratch
/// array.
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
            let mut claimed = SCRATCH_CLAIMED.lock();
            if *claimed {
                return Err(AllocError);
            }
            *claimed = true;
            self.base = unsafe { ptr::addr_of_mut!(SCRATCH_HEAP) as *mut u8 };
        }

        if delta.0 > SCRATCH_LEN_BYTES - self.len {
            return Err(AllocError);
        }

        let first_new = unsafe { self.base.add(self.len) };
        self.len += delta.0;
        extra_assert!(!first_new.is_null());
        Ok(unsafe { NonNull::new_unchecked(first_new) })
    }
}

/// The heap's single-writer cell on this backend: a spin lock, since there
/// is no OS to sleep on.
pub(crate) struct Exclusive<T> {
    inner: Mutex<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: Mutex::new(T::INIT),
    };
}

// With extra assertions on, a lock that is still unavailable after this many
// spins is taken to be re-entered from its own thread rather than contended:
// the allocation paths hold it for far less, even with the full consistency
// sweep they run under that feature.
#[cfg(feature = "extra_assertions")]
const SPIN_LIMIT: usize = 1 << 26;

impl<T> Exclusive<T> {
    #[cfg(feature = "extra_assertions")]
    fn acquire(&self) -> spin::MutexGuard<'_, T> {
        for _ in 0..SPIN_LIMIT {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            core::hint::spin_loop();
        }
        panic!("`Exclusive<T>` spun too long: re-entered while already held?");
    }

    #[cfg(not(feature = "extra_assertions"))]
    #[inline(always)]
    fn acquire(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Get exclusive, mutable access to the inner value.
    ///
    /// # Safety
    ///
    /// `f` must not re-enter this method for the same `Exclusive` instance:
    /// the spin lock is not recursive, so re-entry spins forever on the
    /// holder's own thread. Under `extra_assertions` that hang is converted
    /// into a panic once the spin budget runs out.
    #[inline]
    pub(crate) unsafe fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let mut guard = self.acquire();
        f(&mut guard)
    }
}
