use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Physical page frame number (PFN).
///
/// A `PageFrameNumber` is the physical address of a 4 KiB page shifted right by
/// [`PAGE_SHIFT`]. This is the unit GART entries store and the unit a page list
/// handed to the mapper is expressed in.
///
/// ### Invariants
/// - `base()` is always page aligned.
/// - The width actually representable depends on the entry format
///   (20, 28 or 40 bits); [`PageFrameNumber::fits_in`] checks that.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrameNumber(u64);

impl PageFrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The frame containing `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical base address of this frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    /// Whether this PFN can be stored in a field of `bits` bits.
    #[inline]
    #[must_use]
    pub const fn fits_in(self, bits: u32) -> bool {
        bits >= 64 || self.0 >> bits == 0
    }
}

impl fmt::Debug for PageFrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN({:#x})", self.0)
    }
}

impl fmt::Display for PageFrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for PageFrameNumber {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}
