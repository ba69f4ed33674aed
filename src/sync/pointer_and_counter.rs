//! One 64-bit word holding an aligned pointer and a small counter, so that
//! both can be swapped with a single compare-and-swap.
//!
//! On 64-bit hosts user-space addresses fit in 48 bits, and the low
//! `log2(align_of::<T>())` bits of an aligned pointer are always zero, so those
//! are shifted out:
//!
//! ```text
//!     [counter][pointer >> ALIGN_BITS]
//! bit: 63                            0
//! ```
//!
//! 32-bit hosts keep it simple and use the high half for the counter.
//!
//! This is the only place where pointers become integers and back again.

use std::{fmt, marker::PhantomData, mem::align_of};

use crate::util::num::log2;

#[cfg(target_pointer_width = "64")]
const POINTER_BITS: u32 = 48;

#[cfg(target_pointer_width = "32")]
const POINTER_BITS: u32 = 32;

#[repr(transparent)]
pub struct PointerAndCounter<T> {
    bits: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> PointerAndCounter<T> {
    /// Low pointer bits that are known to be zero and not stored.
    #[cfg(target_pointer_width = "64")]
    pub const ALIGN_BITS: u32 = log2(align_of::<T>());

    #[cfg(target_pointer_width = "32")]
    pub const ALIGN_BITS: u32 = 0;

    /// Pointer bits that are actually stored.
    pub const REAL_POINTER_BITS: u32 = POINTER_BITS - Self::ALIGN_BITS;

    pub const COUNTER_BITS: u32 = u64::BITS - Self::REAL_POINTER_BITS;

    pub const REAL_POINTER_MASK: u64 = u64::MAX >> Self::COUNTER_BITS;

    /// Counters must stay strictly below this to be stored unchanged.
    pub const MAX_COUNTER: u64 = 1 << Self::COUNTER_BITS;

    /// The all-zero word: a null pointer with counter `0`.
    pub const NULL: Self = Self::from_raw(0);

    /// Pack `ptr` and `counter`. Counter bits that don't fit are silently
    /// dropped, which is fine for ABA tagging where only "did it change"
    /// matters.
    ///
    /// # Panics
    ///
    /// - In debug mode if `ptr` is misaligned or has bits above the stored
    ///   pointer width
    #[inline]
    pub fn new_truncating(ptr: *mut T, counter: u64) -> Self {
        let addr = ptr as usize as u64;
        debug_assert!(addr & ((1 << Self::ALIGN_BITS) - 1) == 0, "{ptr:p} is misaligned");
        debug_assert!(addr >> POINTER_BITS == 0, "{ptr:p} doesn't fit in {POINTER_BITS} bits");
        Self::from_raw((addr >> Self::ALIGN_BITS) | (counter << Self::REAL_POINTER_BITS))
    }

    /// Pack `ptr` and `counter`.
    ///
    /// # Panics
    ///
    /// - If `counter >= MAX_COUNTER`
    #[inline]
    pub fn new(ptr: *mut T, counter: u64) -> Self {
        assert!(
            counter < Self::MAX_COUNTER,
            "counter {counter} does not fit in {} bits",
            Self::COUNTER_BITS
        );
        Self::new_truncating(ptr, counter)
    }

    #[inline]
    pub const fn from_raw(bits: u64) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn into_raw(self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn ptr(self) -> *mut T {
        (((self.bits & Self::REAL_POINTER_MASK) << Self::ALIGN_BITS) as usize) as *mut T
    }

    #[inline]
    pub const fn counter(self) -> u64 {
        self.bits >> Self::REAL_POINTER_BITS
    }
}

impl<T> Clone for PointerAndCounter<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PointerAndCounter<T> {}

impl<T> PartialEq for PointerAndCounter<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for PointerAndCounter<T> {}

impl<T> fmt::Debug for PointerAndCounter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerAndCounter")
            .field("ptr", &self.ptr())
            .field("counter", &self.counter())
            .finish()
    }
}
