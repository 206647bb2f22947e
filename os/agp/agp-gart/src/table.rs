//! The GART table manager.
//!
//! [`GartTable`] owns the contiguous block the chipset walks. When the
//! corruption verifier is on, the block is twice the table size and the
//! upper half shadows the lower half entry for entry.
//!
//! Allocation is first-fit with a direction bias: uncached reservations are
//! packed from the high end, write-combined (and coherent) ones from the low
//! end, which keeps the two traffic classes apart.
//!
//! None of this is reentrant. Callers serialize every call (see
//! [`ApertureLock`](agp_sync::ApertureLock)).

use crate::GartError;
use crate::entry::{CacheType, EntryState, GartEntry, PteFormat};
use crate::guard;
use crate::platform::{ContiguousAlloc, ContiguousBlock};
use crate::verifier::{PearsonChecksum, VerifierState};
use agp_memory_addresses::{PAGE_SIZE, PageFrameNumber, PhysicalAddress, bytes_to_pages, is_aligned};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering, fence};
use log::{debug, error, info, trace, warn};

/// Translation buffer control used to bracket hardware-visible updates.
///
/// Entries are only rewritten while the TLB is disabled, so the chipset can
/// never cache a half-written translation.
pub trait TlbControl {
    /// # Errors
    /// Propagates register access failures.
    fn disable_tlb(&mut self) -> Result<(), GartError>;

    /// # Errors
    /// Propagates register access failures.
    fn enable_tlb(&mut self) -> Result<(), GartError>;
}

/// Source of [`GartTable`] generations; every created table gets a new one.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// One reservation in the aperture, owned by whoever reserved it.
///
/// Deliberately neither `Clone` nor `Copy`: releasing clears
/// [`memory_base`](Self::memory_base), and a copy would keep a stale one.
///
/// A range is bound to the table it was reserved in. Once that table is
/// destroyed (the aperture was disabled or resized) every operation on the
/// range fails with [`GartError::InvalidParameter`].
#[derive(Debug, PartialEq, Eq)]
pub struct ApertureRange {
    start: usize,
    pages: usize,
    cache: CacheType,
    memory_base: Option<PhysicalAddress>,
    generation: u64,
    pub(crate) committed_pages: usize,
}

impl ApertureRange {
    /// First table index of the reservation.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn cache_type(&self) -> CacheType {
        self.cache
    }

    /// Aperture address of the first page, `None` once released.
    #[inline]
    #[must_use]
    pub const fn memory_base(&self) -> Option<PhysicalAddress> {
        self.memory_base
    }

    /// Pages committed through the interface layer.
    #[inline]
    #[must_use]
    pub const fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    #[inline]
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.memory_base.is_some()
    }

    /// Table indices covered by the reservation.
    #[must_use]
    pub const fn indices(&self) -> Range<usize> {
        self.start..self.start + self.pages
    }

    /// Whether `[offset, offset + count)` lies inside the reservation.
    #[must_use]
    pub fn contains(&self, offset: usize, count: usize) -> bool {
        offset.checked_add(count).is_some_and(|end| end <= self.pages)
    }

    /// Mark the range released without touching any table.
    pub(crate) fn retire(&mut self) {
        self.memory_base = None;
    }
}

/// A run of reserved-but-unmapped entries, relative to a range.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FreeRun {
    pub offset: usize,
    pub len: usize,
}

/// Entries per state bucket. Every entry is in exactly one bucket.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub free: usize,
    pub reserved: usize,
    pub mapped: usize,
    pub guard: usize,
}

impl EntryCounts {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.free + self.reserved + self.mapped + self.guard
    }

    /// Reserved or mapped entries; guard entries are not allocations.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.reserved + self.mapped
    }
}

/// The GART: a contiguous array of entries in format `F`.
pub struct GartTable<F: PteFormat> {
    block: ContiguousBlock,
    len: usize,
    /// Index offset of the shadow copy inside `block`.
    shadow: Option<usize>,
    /// Stamped into every range reserved here.
    generation: u64,
    _format: PhantomData<F>,
}

impl<F: PteFormat> GartTable<F> {
    /// Allocate and initialize a table covering `aperture_bytes`.
    ///
    /// With corruption verification on, a double-size block is attempted
    /// first; if that fails the corruption flag is cleared in `verifier` and a
    /// plain table is allocated instead. `max_address` is the first physical
    /// address the chipset can no longer reach.
    ///
    /// # Errors
    /// - [`GartError::InvalidParameter`] for an empty aperture.
    /// - [`GartError::InsufficientResources`] if no suitable block exists.
    pub fn create<A: ContiguousAlloc>(
        alloc: &mut A,
        aperture_bytes: u64,
        max_address: u64,
        verifier: &mut VerifierState,
    ) -> Result<Self, GartError> {
        let len = usize::try_from(bytes_to_pages(aperture_bytes))
            .map_err(|_| GartError::InvalidParameter)?;
        if len == 0 {
            return Err(GartError::InvalidParameter);
        }
        let bytes = len
            .checked_mul(F::BYTES)
            .ok_or(GartError::InsufficientResources)?;

        let mut block = None;
        let mut shadow = None;
        if verifier.flags().corruption() {
            if let Some(b) = bytes
                .checked_mul(2)
                .and_then(|double| Self::allocate_below(alloc, double, max_address))
            {
                block = Some(b);
                shadow = Some(len);
            } else {
                warn!("Couldn't allocate GART shadow, corruption verification disabled");
                verifier.degrade_corruption();
            }
        }

        let block = match block {
            Some(b) => b,
            None => Self::allocate_below(alloc, bytes, max_address).ok_or_else(|| {
                error!("Failed to allocate {bytes:#x} bytes for a {} GART", F::NAME);
                GartError::InsufficientResources
            })?,
        };
        debug_assert!(is_aligned(block.phys().as_u64(), PAGE_SIZE));

        let mut table = Self {
            block,
            len,
            shadow,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            _format: PhantomData,
        };

        let free = GartEntry::free(verifier);
        for index in 0..len {
            table.store(index, free, verifier);
        }

        let flags = verifier.flags();
        if flags.guard() {
            let quarter = guard::install(&mut table, verifier);
            debug!("Installed {quarter} guard entries at each end of the GART");
        }

        if let Some(offset) = table.shadow {
            for index in 0..len {
                let raw = table.raw(index);
                table.write_slot(index + offset, raw);
            }
        }

        info!(
            "Created {} GART of {len} entries at {} (guard: {}, corruption: {})",
            F::NAME,
            table.physical_base(),
            flags.guard(),
            table.shadow.is_some()
        );
        Ok(table)
    }

    fn allocate_below<A: ContiguousAlloc>(
        alloc: &mut A,
        bytes: usize,
        max_address: u64,
    ) -> Option<ContiguousBlock> {
        let block = alloc.allocate_contiguous(bytes, CacheType::Uncached)?;
        debug_assert!(block.len() >= bytes);
        let end = block.phys().as_u64().checked_add(bytes as u64);
        if end.is_none_or(|end| end > max_address) {
            warn!("GART block at {} is out of reach of the chipset", block.phys());
            // Safety: the block was just handed out by `alloc` and never used.
            unsafe { alloc.free_contiguous(block) };
            return None;
        }
        Some(block)
    }

    /// Hand the backing block back to `alloc`.
    ///
    /// # Safety
    /// `alloc` must be the allocator the table was created with.
    pub unsafe fn destroy<A: ContiguousAlloc>(self, alloc: &mut A) {
        debug!("Freeing GART at {}", self.block.phys());
        // Safety: forwarded to the caller.
        unsafe { alloc.free_contiguous(self.block) };
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

    /// Physical address programmed into the chipset's GART base register.
    #[inline]
    #[must_use]
    pub const fn physical_base(&self) -> PhysicalAddress {
        self.block.phys()
    }

    /// Whether `range` was reserved in this table.
    #[must_use]
    pub fn owns(&self, range: &ApertureRange) -> bool {
        range.generation == self.generation && range.indices().end <= self.len
    }

    #[inline]
    #[must_use]
    pub const fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn shadow_offset(&self) -> Option<usize> {
        self.shadow
    }

    const fn slots(&self) -> usize {
        match self.shadow {
            Some(offset) => offset + self.len,
            None => self.len,
        }
    }

    fn slot(&self, slot: usize) -> *mut F::Raw {
        assert!(slot < self.slots(), "GART slot {slot} out of bounds");
        // Safety: `slot` is inside the block, which holds `slots()` entries.
        unsafe { self.block.virt().cast::<F::Raw>().as_ptr().add(slot) }
    }

    fn write_slot(&mut self, slot: usize, raw: F::Raw) {
        // Safety: in bounds and the block is exclusively ours.
        unsafe { ptr::write_volatile(self.slot(slot), raw) };
    }

    /// The stored word of primary entry `index`.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    #[must_use]
    pub fn raw(&self, index: usize) -> F::Raw {
        assert!(index < self.len, "GART index {index} out of bounds");
        // Safety: in bounds; volatile since hardware may look at it.
        unsafe { ptr::read_volatile(self.slot(index)) }
    }

    /// The shadow word of entry `index` (the primary word without a shadow).
    #[must_use]
    pub fn shadow_raw(&self, index: usize) -> F::Raw {
        assert!(index < self.len, "GART index {index} out of bounds");
        let slot = self.shadow.map_or(index, |offset| index + offset);
        // Safety: in bounds.
        unsafe { ptr::read_volatile(self.slot(slot)) }
    }

    /// Decoded primary entry `index`.
    #[must_use]
    pub fn entry(&self, index: usize) -> GartEntry {
        F::decode(self.raw(index))
    }

    /// Physical address of primary entry `index`.
    #[must_use]
    pub fn entry_address(&self, index: usize) -> PhysicalAddress {
        self.block.phys() + (index * F::BYTES) as u64
    }

    /// Physical address of the shadow of entry `index`.
    #[must_use]
    pub fn shadow_address(&self, index: usize) -> PhysicalAddress {
        self.entry_address(self.shadow.map_or(index, |offset| index + offset))
    }

    pub(crate) fn store(&mut self, index: usize, entry: GartEntry, verifier: &VerifierState) {
        assert!(index < self.len, "GART index {index} out of bounds");
        self.write_slot(index, F::encode(entry, verifier));
    }

    fn mirror(&mut self, index: usize) {
        if let Some(offset) = self.shadow {
            let raw = self.raw(index);
            self.write_slot(index + offset, raw);
        }
    }

    /// Read the entry back so posted writes reach memory before the TLB
    /// is re-enabled.
    fn flush_writes(&self, index: usize) {
        let _ = self.raw(index);
        fence(Ordering::SeqCst);
    }

    /// Checksum of the primary region's raw bytes.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let mut sum = PearsonChecksum::new();
        for index in 0..self.len {
            let raw: u64 = self.raw(index).into();
            sum.update(&raw.to_le_bytes()[..F::BYTES]);
        }
        sum.finish()
    }

    #[must_use]
    pub fn counts(&self) -> EntryCounts {
        let mut counts = EntryCounts::default();
        for index in 0..self.len {
            let state = self.entry(index).state;
            match state {
                EntryState::Free => counts.free += 1,
                EntryState::Guard => counts.guard += 1,
                s if s.is_valid() => counts.mapped += 1,
                _ => counts.reserved += 1,
            }
        }
        counts
    }

    /// First-fit search for `length` consecutive free entries.
    ///
    /// Scanning backward returns the lowest index of the run nearest the end
    /// of the table; scanning forward, the lowest index of the first run.
    #[must_use]
    pub fn find_free_range(
        &self,
        length: usize,
        search_backward: bool,
        verifier: &VerifierState,
    ) -> Option<usize> {
        if length == 0 || length > self.len {
            return None;
        }

        let mut found = 0;
        if search_backward {
            for index in (0..self.len).rev() {
                if self.entry(index).is_free(verifier) {
                    found += 1;
                    if found == length {
                        return Some(index);
                    }
                } else {
                    found = 0;
                }
            }
        } else {
            for index in 0..self.len {
                if self.entry(index).is_free(verifier) {
                    found += 1;
                    if found == length {
                        return Some(index + 1 - length);
                    }
                } else {
                    found = 0;
                }
            }
        }
        None
    }

    /// Reserve `pages` contiguous entries with the given cache policy.
    ///
    /// # Errors
    /// - [`GartError::InvalidParameter`] for an empty request.
    /// - [`GartError::InsufficientResources`] if no free run is long enough.
    pub fn reserve(
        &mut self,
        pages: usize,
        cache: CacheType,
        aperture_base: PhysicalAddress,
        verifier: &VerifierState,
    ) -> Result<ApertureRange, GartError> {
        if pages == 0 {
            return Err(GartError::InvalidParameter);
        }
        if pages > self.len {
            return Err(GartError::InsufficientResources);
        }

        let backward = cache == CacheType::Uncached;
        let Some(start) = self.find_free_range(pages, backward, verifier) else {
            error!(
                "Could not find {pages} contiguous free {cache:?} entries in GART at {}",
                self.physical_base()
            );
            return Err(GartError::InsufficientResources);
        };

        let reserved = GartEntry::unmapped(EntryState::reserved(cache), verifier);
        for index in start..start + pages {
            debug_assert!(self.entry(index).is_free(verifier));
            self.store(index, reserved, verifier);
            self.mirror(index);
        }

        let memory_base = aperture_base.add_pages(start as u64);
        debug!("Reserved {pages} {cache:?} pages at GART index {start}, aperture {memory_base}");
        Ok(ApertureRange {
            start,
            pages,
            cache,
            memory_base: Some(memory_base),
            generation: self.generation,
            committed_pages: 0,
        })
    }

    /// Return every entry of `range` to free and clear its memory base.
    ///
    /// Releasing a range twice, or one that still has mapped pages, is a
    /// programming error. A range from an earlier table is only marked
    /// released; the entries it named belong to someone else now.
    pub fn release(&mut self, range: &mut ApertureRange, verifier: &VerifierState) {
        debug_assert!(range.is_live(), "release of an already released aperture range");
        if !range.is_live() {
            return;
        }
        if !self.owns(range) {
            warn!("Releasing a range of a destroyed GART (index {})", range.start);
            range.retire();
            return;
        }

        let reserved = EntryState::reserved(range.cache);
        let free = GartEntry::free(verifier);
        for index in range.indices() {
            debug_assert!(
                self.entry(index).is_reserved_as(reserved, verifier),
                "GART entry {index} is {:?}, expected {reserved:?}",
                self.entry(index)
            );
            self.store(index, free, verifier);
            self.mirror(index);
        }

        debug!("Released {} pages at GART index {}", range.pages, range.start);
        range.memory_base = None;
    }

    /// Map `pages` into `range` starting `offset` pages in.
    ///
    /// Returns the aperture address of the first mapped page.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] for an empty page list, a window
    /// outside the range, a released or foreign range, a frame the format
    /// cannot address, or the verifier's sentinel frame. TLB control failures
    /// are propagated.
    pub fn map_pages<T: TlbControl>(
        &mut self,
        tlb: &mut T,
        range: &ApertureRange,
        pages: &[PageFrameNumber],
        offset: usize,
        verifier: &VerifierState,
    ) -> Result<PhysicalAddress, GartError> {
        debug_assert!(range.is_live(), "map into a released aperture range");
        let Some(base) = range.memory_base else {
            return Err(GartError::InvalidParameter);
        };
        if !self.owns(range) {
            warn!("Map into a range of a destroyed GART (index {})", range.start);
            return Err(GartError::InvalidParameter);
        }
        if pages.is_empty() || !range.contains(offset, pages.len()) {
            return Err(GartError::InvalidParameter);
        }
        if let Some(page) = pages.iter().find(|p| !p.fits_in(F::PFN_BITS)) {
            warn!("Page {page} is beyond the reach of the {} format", F::NAME);
            return Err(GartError::InvalidParameter);
        }
        // A mapped sentinel would be indistinguishable from an unmapped entry.
        if let Some(sentinel) = verifier.sentinel()
            && pages.contains(&sentinel)
        {
            warn!("Page {sentinel} is the verifier sentinel and cannot be mapped");
            return Err(GartError::InvalidParameter);
        }

        let target = EntryState::reserved(range.cache);
        let first = range.start + offset;

        tlb.disable_tlb()?;
        for (index, &page) in (first..).zip(pages) {
            debug_assert!(
                self.entry(index).is_reserved_as(target, verifier),
                "GART entry {index} is {:?}, expected {target:?}",
                self.entry(index)
            );
            self.store(index, GartEntry::mapped(range.cache, page), verifier);
            self.mirror(index);
        }
        self.flush_writes(first + pages.len() - 1);
        tlb.enable_tlb()?;

        trace!("Mapped {} pages at GART index {first}", pages.len());
        Ok(base.add_pages(offset as u64))
    }

    /// Unmap up to `count` entries of `range` starting `offset` pages in.
    ///
    /// Entries that are not mapped are skipped, so unmapping a partially
    /// mapped window is fine.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] for a window outside the range or a
    /// released or foreign range. TLB control failures are propagated.
    pub fn unmap_pages<T: TlbControl>(
        &mut self,
        tlb: &mut T,
        range: &ApertureRange,
        count: usize,
        offset: usize,
        verifier: &VerifierState,
    ) -> Result<(), GartError> {
        debug_assert!(range.is_live(), "unmap from a released aperture range");
        if !range.is_live() || !self.owns(range) || !range.contains(offset, count) {
            return Err(GartError::InvalidParameter);
        }
        if count == 0 {
            return Ok(());
        }

        let first = range.start + offset;
        tlb.disable_tlb()?;
        let mut last_changed = None;
        for index in first..first + count {
            let entry = self.entry(index);
            if entry.is_mapped(verifier) {
                self.store(index, GartEntry::unmapped(entry.state.unmapped(), verifier), verifier);
                self.mirror(index);
                last_changed = Some(index);
            } else {
                trace!("GART entry {index} ({entry:?}) not mapped");
            }
        }
        if let Some(index) = last_changed {
            self.flush_writes(index);
        }
        tlb.enable_tlb()?;

        trace!("Unmapped {count} pages at GART index {first}");
        Ok(())
    }

    /// First run of reserved-but-unmapped entries in `[offset, offset + count)`
    /// of `range`. A zero-length run means there is none.
    #[must_use]
    pub fn find_free_run(
        &self,
        range: &ApertureRange,
        count: usize,
        offset: usize,
        verifier: &VerifierState,
    ) -> FreeRun {
        if !range.is_live() || !self.owns(range) {
            return FreeRun::default();
        }

        let end = offset.saturating_add(count).min(range.pages);
        let reserved = |i: usize| self.entry(range.start + i).is_reserved(verifier);

        let mut i = offset;
        while i < end {
            if reserved(i) {
                let run = i;
                while i < end && reserved(i) {
                    i += 1;
                }
                return FreeRun {
                    offset: run,
                    len: i - run,
                };
            }
            i += 1;
        }
        FreeRun::default()
    }

    /// The frames mapped into `[offset, offset + count)` of `range`, in order.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] if the window is outside the range or
    /// any entry in it is not mapped.
    pub fn get_mapped_pages(
        &self,
        range: &ApertureRange,
        count: usize,
        offset: usize,
        verifier: &VerifierState,
    ) -> Result<Vec<PageFrameNumber>, GartError> {
        if !range.is_live() || !self.owns(range) || !range.contains(offset, count) {
            return Err(GartError::InvalidParameter);
        }

        let first = range.start + offset;
        let mut pages = Vec::with_capacity(count);
        for index in first..first + count {
            let entry = self.entry(index);
            if !entry.is_mapped(verifier) {
                warn!("GART entry {index} ({entry:?}) is not mapped");
                return Err(GartError::InvalidParameter);
            }
            pages.push(entry.page);
        }
        Ok(pages)
    }
}

impl<F: PteFormat> core::fmt::Debug for GartTable<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GartTable")
            .field("format", &F::NAME)
            .field("base", &self.block.phys())
            .field("len", &self.len)
            .field("shadow", &self.shadow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Gart32Pte;
    use crate::sim::SimPlatform;
    use crate::verifier::VerifierFlags;

    const MIB: u64 = 1024 * 1024;
    const APERTURE: PhysicalAddress = PhysicalAddress::new(0xE000_0000);

    #[derive(Default)]
    struct CountingTlb {
        disabled: usize,
        enabled: usize,
    }

    impl TlbControl for CountingTlb {
        fn disable_tlb(&mut self) -> Result<(), GartError> {
            assert_eq!(self.disabled, self.enabled, "TLB disabled twice");
            self.disabled += 1;
            Ok(())
        }

        fn enable_tlb(&mut self) -> Result<(), GartError> {
            self.enabled += 1;
            assert_eq!(self.disabled, self.enabled, "TLB enabled while not disabled");
            Ok(())
        }
    }

    fn table(sim: &mut SimPlatform, verifier: &mut VerifierState) -> GartTable<Gart32Pte> {
        GartTable::create(sim, 16 * MIB, u64::MAX, verifier).unwrap()
    }

    #[test]
    fn create_initializes_every_entry_free() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let t = table(&mut sim, &mut v);
        assert_eq!(t.len(), 4096);
        assert!(!t.has_shadow());
        assert_eq!(t.counts().free, 4096);
        assert!(is_aligned(t.physical_base().as_u64(), PAGE_SIZE));
        unsafe { t.destroy(&mut sim) };
        assert_eq!(sim.contiguous_blocks(), 0);
    }

    #[test]
    fn shadow_degrades_to_plain_table() {
        let mut sim = SimPlatform::intel440();
        sim.fail_contiguous_above(16 * 1024);
        let mut v = VerifierState::disabled();
        v.arm(
            VerifierFlags::new().with_corruption(true).with_guard(true),
            PageFrameNumber::new(0x99),
        )
        .unwrap();

        let t = table(&mut sim, &mut v);
        assert!(!t.has_shadow());
        assert!(!v.flags().corruption());
        assert!(v.flags().guard());
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn unreachable_block_is_rejected() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let result = GartTable::<Gart32Pte>::create(&mut sim, 16 * MIB, 0x1000, &mut v);
        assert_eq!(result.err(), Some(GartError::InsufficientResources));
        assert_eq!(sim.contiguous_blocks(), 0);
    }

    #[test]
    fn forward_and_backward_first_fit() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let mut t = table(&mut sim, &mut v);

        // Punch a reservation in the middle of the table.
        let mut middle = t.reserve(10, CacheType::WriteCombined, APERTURE, &v).unwrap();
        assert_eq!(middle.start(), 0);
        let blocker = t.reserve(1, CacheType::WriteCombined, APERTURE, &v).unwrap();
        t.release(&mut middle, &v);

        // A 5-page run fits in the hole at the front, a 20-page run does not.
        assert_eq!(t.find_free_range(5, false, &v), Some(0));
        assert_eq!(t.find_free_range(20, false, &v), Some(11));
        assert_eq!(t.find_free_range(5, true, &v), Some(4091));
        assert_eq!(t.find_free_range(4096, true, &v), None);
        assert_eq!(t.find_free_range(0, true, &v), None);
        assert_eq!(blocker.start(), 10);
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn map_brackets_with_tlb_and_unmap_is_idempotent() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let mut t = table(&mut sim, &mut v);
        let range = t.reserve(8, CacheType::Uncached, APERTURE, &v).unwrap();
        let pages: Vec<_> = (0x100..0x104).map(PageFrameNumber::new).collect();

        let mut tlb = CountingTlb::default();
        let base = t.map_pages(&mut tlb, &range, &pages, 2, &v).unwrap();
        assert_eq!(base, APERTURE.add_pages(4088 + 2));
        assert_eq!((tlb.disabled, tlb.enabled), (1, 1));

        let counts = t.counts();
        assert_eq!((counts.mapped, counts.reserved), (4, 4));

        t.unmap_pages(&mut tlb, &range, 8, 0, &v).unwrap();
        t.unmap_pages(&mut tlb, &range, 8, 0, &v).unwrap();
        assert_eq!(t.counts().reserved, 8);
        assert_eq!(t.entry(4090).state, EntryState::ReservedUncached);
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn map_rejects_bad_windows_and_wide_frames() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let mut t = table(&mut sim, &mut v);
        let range = t.reserve(4, CacheType::WriteCombined, APERTURE, &v).unwrap();
        let mut tlb = CountingTlb::default();

        let page = [PageFrameNumber::new(1)];
        assert_eq!(t.map_pages(&mut tlb, &range, &page, 4, &v), Err(GartError::InvalidParameter));
        assert_eq!(t.map_pages(&mut tlb, &range, &[], 0, &v), Err(GartError::InvalidParameter));

        let wide = [PageFrameNumber::new(1 << 20)];
        assert_eq!(t.map_pages(&mut tlb, &range, &wide, 0, &v), Err(GartError::InvalidParameter));
        assert_eq!(tlb.disabled, 0);
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn find_free_run_skips_mapped_entries() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let mut t = table(&mut sim, &mut v);
        let range = t.reserve(10, CacheType::WriteCombined, APERTURE, &v).unwrap();
        let mut tlb = CountingTlb::default();
        t.map_pages(&mut tlb, &range, &[PageFrameNumber::new(7); 3], 0, &v)
            .unwrap();

        assert_eq!(t.find_free_run(&range, 10, 0, &v), FreeRun { offset: 3, len: 7 });
        assert_eq!(t.find_free_run(&range, 2, 0, &v), FreeRun::default());
        assert_eq!(t.find_free_run(&range, 4, 1, &v), FreeRun { offset: 3, len: 2 });
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn shadow_tracks_every_update() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        v.arm(VerifierFlags::new().with_corruption(true), PageFrameNumber::new(0x55))
            .unwrap();
        let mut t = table(&mut sim, &mut v);
        assert_eq!(t.shadow_offset(), Some(4096));

        let mut range = t.reserve(16, CacheType::Uncached, APERTURE, &v).unwrap();
        let mut tlb = CountingTlb::default();
        let pages: Vec<_> = (1..=16).map(PageFrameNumber::new).collect();
        t.map_pages(&mut tlb, &range, &pages, 0, &v).unwrap();
        t.unmap_pages(&mut tlb, &range, 16, 0, &v).unwrap();
        t.release(&mut range, &v);

        for index in 0..t.len() {
            assert_eq!(t.raw(index), t.shadow_raw(index), "entry {index}");
        }
        assert_eq!(t.shadow_address(0), t.entry_address(4096));
        unsafe { t.destroy(&mut sim) };
    }

    #[test]
    fn ranges_belong_to_their_table() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let mut big = table(&mut sim, &mut v);
        let mut small = GartTable::<Gart32Pte>::create(&mut sim, 4 * MIB, u64::MAX, &mut v).unwrap();

        let mut range = big.reserve(8, CacheType::Uncached, APERTURE, &v).unwrap();
        assert!(big.owns(&range));
        assert!(!small.owns(&range));

        let mut tlb = CountingTlb::default();
        let page = [PageFrameNumber::new(1)];
        assert_eq!(small.map_pages(&mut tlb, &range, &page, 0, &v), Err(GartError::InvalidParameter));
        assert_eq!(small.unmap_pages(&mut tlb, &range, 1, 0, &v), Err(GartError::InvalidParameter));
        assert_eq!(small.get_mapped_pages(&range, 1, 0, &v), Err(GartError::InvalidParameter));
        assert_eq!(small.find_free_run(&range, 8, 0, &v), FreeRun::default());
        assert_eq!(tlb.disabled, 0);

        small.release(&mut range, &v);
        assert!(!range.is_live());
        assert_eq!(small.counts().free, 1024);
        assert_eq!(big.counts().reserved, 8);
        unsafe {
            small.destroy(&mut sim);
            big.destroy(&mut sim);
        }
    }

    #[test]
    fn sentinel_is_not_a_mappable_frame() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        let sentinel = PageFrameNumber::new(0x77);
        v.arm(VerifierFlags::new().with_gart_access(true), sentinel).unwrap();
        let mut t = table(&mut sim, &mut v);
        let range = t.reserve(2, CacheType::WriteCombined, APERTURE, &v).unwrap();

        let mut tlb = CountingTlb::default();
        let pages = [PageFrameNumber::new(0x76), sentinel];
        assert_eq!(t.map_pages(&mut tlb, &range, &pages, 0, &v), Err(GartError::InvalidParameter));
        assert_eq!(tlb.disabled, 0);
        assert_eq!(t.counts().reserved, 2);
        unsafe { t.destroy(&mut sim) };
    }
}
