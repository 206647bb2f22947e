//! Memory services the aperture needs from its host.

use crate::entry::CacheType;
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};
use alloc::vec::Vec;
use core::ptr::NonNull;

/// A physically contiguous, page aligned block mapped into the current
/// address space.
#[derive(Debug)]
pub struct ContiguousBlock {
    virt: NonNull<u8>,
    phys: PhysicalAddress,
    len: usize,
}

// Safety: the block is an owning handle; whoever holds it has exclusive
// access to the memory until it is handed back to the allocator.
unsafe impl Send for ContiguousBlock {}

impl ContiguousBlock {
    /// # Safety
    /// `virt` must be valid for reads and writes of `len` bytes, page
    /// aligned, and must map the physical range starting at `phys` for as
    /// long as the block exists.
    #[must_use]
    pub const unsafe fn new(virt: NonNull<u8>, phys: PhysicalAddress, len: usize) -> Self {
        Self { virt, phys, len }
    }

    #[inline]
    #[must_use]
    pub const fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocator for the GART table itself.
///
/// # Safety
/// Implementations must hand out blocks that satisfy the contract of
/// [`ContiguousBlock::new`].
pub unsafe trait ContiguousAlloc {
    /// Allocate `bytes` of physically contiguous memory with the given
    /// caching. Returns `None` on exhaustion.
    fn allocate_contiguous(&mut self, bytes: usize, cache: CacheType) -> Option<ContiguousBlock>;

    /// # Safety
    /// `block` must come from this allocator and no pointer into it may be
    /// used afterwards.
    unsafe fn free_contiguous(&mut self, block: ContiguousBlock);
}

/// Source of the physical pages committed into reservations.
pub trait PageAlloc {
    /// Allocate up to `count` pages. May return fewer (or none) when memory
    /// is short.
    fn allocate_pages(&mut self, count: usize) -> Vec<PageFrameNumber>;

    fn free_pages(&mut self, pages: &[PageFrameNumber]);
}
