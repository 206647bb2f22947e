//! # Physical Address Types for the AGP Aperture
//!
//! Strongly typed wrappers for the two kinds of numbers a GART juggles all the
//! time: byte-granular physical addresses and page frame numbers.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address (RAM, MMIO, or the aperture window). |
//! | [`PageFrameNumber`] | The index of a 4 KiB physical page (`address >> PAGE_SHIFT`). |
//!
//! GART entries store page frame numbers, while the chipset registers and the
//! caller-visible aperture ranges deal in byte addresses. Keeping the two apart
//! at the type level avoids the classic off-by-`PAGE_SHIFT` bug.
//!
//! ```rust
//! # use agp_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0123_4567);
//! let pfn = PageFrameNumber::containing(pa);
//! assert_eq!(pfn.as_u64(), 0x1234);
//! assert_eq!(pfn.base().as_u64(), 0x0123_4000);
//! assert_eq!(pa.page_offset(), 0x567);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_frame_number;
mod physical_address;

pub use crate::page_frame_number::PageFrameNumber;
pub use crate::physical_address::PhysicalAddress;

/// log2 of the GART page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size in bytes of one GART page (and one aperture page).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of pages needed to hold `bytes` bytes (rounded up).
///
/// ```rust
/// # use agp_memory_addresses::bytes_to_pages;
/// assert_eq!(bytes_to_pages(0), 0);
/// assert_eq!(bytes_to_pages(1), 1);
/// assert_eq!(bytes_to_pages(4096), 1);
/// assert_eq!(bytes_to_pages(16 * 1024 * 1024), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Number of bytes covered by `pages` pages.
#[inline(always)]
#[must_use]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}

/// Return `true` if `x` is a multiple of `a`.
///
/// `a` must be a non-zero power of two.
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    debug_assert!(a.is_power_of_two());
    x & (a - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        assert_eq!(pages_to_bytes(bytes_to_pages(4097)), 8192);
        assert!(is_aligned(0x1000_0000, 0x0400_0000));
        assert!(!is_aligned(0x1000_1000, 0x0400_0000));
    }
}
