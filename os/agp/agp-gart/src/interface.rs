//! The locked interface handed to graphics drivers.
//!
//! Every call takes the aperture's [`ApertureLock`] for its whole duration,
//! so reservations, commits and verifier ticks never interleave. On top of
//! the raw aperture operations this layer owns physical memory: it can
//! commit freshly allocated pages into a reservation and give them back.

use crate::GartError;
use crate::aperture::{Aperture, ApertureInfo, ConfigurationDrift};
use crate::chipset::Chipset;
use crate::entry::{CacheType, PteFormat};
use crate::platform::{ContiguousAlloc, PageAlloc};
use crate::rate::SpecialTargetFlags;
use crate::table::ApertureRange;
use crate::verifier::CheckOutcome;
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};
use agp_registers::AgpBus;
use agp_sync::ApertureLock;
use alloc::vec::Vec;
use log::{error, warn};

/// Memory committed by [`AgpInterface::commit_memory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Aperture address of the first committed page.
    pub base: PhysicalAddress,
    /// Every page now backing the window, in aperture order.
    pub pages: Vec<PageFrameNumber>,
}

/// Result of one [`AgpInterface::verifier_tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierTick {
    pub outcome: CheckOutcome,
    pub drift: Option<ConfigurationDrift>,
}

/// Rate request flag: stop using side band addressing.
pub const SET_RATE_DISABLE_SBA: u32 = 0x0001_0000;
/// Rate request flag: stop using fast writes.
pub const SET_RATE_DISABLE_FW: u32 = 0x0002_0000;
const SET_RATE_MASK: u32 = 0xF;

pub struct AgpInterface<C, P>
where
    C: Chipset,
    P: AgpBus + ContiguousAlloc + PageAlloc,
{
    aperture: ApertureLock<Aperture<C, P>>,
}

impl<C, P> AgpInterface<C, P>
where
    C: Chipset,
    P: AgpBus + ContiguousAlloc + PageAlloc,
{
    #[must_use]
    pub const fn new(aperture: Aperture<C, P>) -> Self {
        Self {
            aperture: ApertureLock::new(aperture),
        }
    }

    /// Run `f` with exclusive access to the aperture.
    pub fn with_aperture<R>(&self, f: impl FnOnce(&mut Aperture<C, P>) -> R) -> R {
        self.aperture.with_lock(f)
    }

    #[must_use]
    pub fn into_inner(self) -> Aperture<C, P> {
        self.aperture.into_inner()
    }

    /// # Errors
    /// As [`Aperture::reserve`].
    pub fn reserve_memory(&self, pages: usize, cache: CacheType) -> Result<ApertureRange, GartError> {
        self.aperture.lock().reserve(pages, cache)
    }

    /// Release a reservation with nothing committed in it.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] while pages are still committed.
    pub fn release_memory(&self, range: &mut ApertureRange) -> Result<(), GartError> {
        if range.committed_pages() != 0 {
            warn!(
                "Refusing to release a range with {} pages committed",
                range.committed_pages()
            );
            return Err(GartError::InvalidParameter);
        }
        self.aperture.lock().release(range);
        Ok(())
    }

    /// Back the unmapped part of `[offset, offset + pages)` with newly
    /// allocated pages.
    ///
    /// All or nothing: on failure every page this call mapped is unmapped and
    /// freed again. Pages the rollback cannot unmap stay committed to `range`
    /// so a later [`free_memory`](Self::free_memory) can reclaim them.
    ///
    /// # Errors
    /// - [`GartError::InvalidParameter`] for an empty or out-of-range window.
    /// - [`GartError::InsufficientResources`] if pages run out, or if there
    ///   was nothing left to commit.
    pub fn commit_memory(
        &self,
        range: &mut ApertureRange,
        pages: usize,
        offset: usize,
    ) -> Result<Committed, GartError> {
        if pages == 0 || !range.contains(offset, pages) {
            return Err(GartError::InvalidParameter);
        }

        let mut aperture = self.aperture.lock();
        let end = offset + pages;
        let mut cursor = offset;
        let mut mapped: Vec<(usize, Vec<PageFrameNumber>)> = Vec::new();

        let status = loop {
            let run = aperture.find_free_run(range, end - cursor, cursor);
            if run.len == 0 {
                break if mapped.is_empty() {
                    Err(GartError::InsufficientResources)
                } else {
                    Ok(())
                };
            }
            cursor = run.offset + run.len;

            let frames = aperture.platform_mut().allocate_pages(run.len);
            if frames.len() < run.len {
                error!("Only {} of {} pages available to commit", frames.len(), run.len);
                aperture.platform_mut().free_pages(&frames);
                break Err(GartError::InsufficientResources);
            }
            if let Err(e) = aperture.map_pages(range, &frames, run.offset) {
                error!("Mapping {} committed pages failed: {e}", run.len);
                aperture.platform_mut().free_pages(&frames);
                break Err(e);
            }
            mapped.push((run.offset, frames));
        };

        if let Err(e) = status {
            for (run_offset, frames) in mapped.iter().rev() {
                if let Err(unmap) = aperture.unmap_pages(range, frames.len(), *run_offset) {
                    // Still visible through the aperture, so they cannot go
                    // back to the allocator. Keep them committed instead.
                    error!(
                        "Rollback could not unmap {} pages at offset {run_offset}: {unmap}",
                        frames.len()
                    );
                    range.committed_pages += frames.len();
                    continue;
                }
                aperture.platform_mut().free_pages(frames);
            }
            return Err(e);
        }

        range.committed_pages += mapped.iter().map(|(_, f)| f.len()).sum::<usize>();
        let pages = aperture.get_mapped_pages(range, pages, offset)?;
        let base = range
            .memory_base()
            .ok_or(GartError::InvalidParameter)?
            .add_pages(offset as u64);
        Ok(Committed { base, pages })
    }

    /// Unmap committed pages and hand them back to the allocator.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] for an out-of-range window or one that
    /// is not fully mapped.
    pub fn free_memory(
        &self,
        range: &mut ApertureRange,
        pages: usize,
        offset: usize,
    ) -> Result<(), GartError> {
        if offset >= range.pages() || !range.contains(offset, pages) {
            warn!("Invalid free of {pages} pages at offset {offset} of a {}-page range", range.pages());
            return Err(GartError::InvalidParameter);
        }

        let mut aperture = self.aperture.lock();
        let frames = aperture.get_mapped_pages(range, pages, offset)?;
        aperture.unmap_pages(range, pages, offset)?;
        aperture.platform_mut().free_pages(&frames);

        debug_assert!(range.committed_pages >= pages);
        range.committed_pages = range.committed_pages.saturating_sub(pages);
        Ok(())
    }

    /// Map caller-owned pages into an uncommitted window.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] if a frame is beyond what the entry
    /// format can address, or the window is already partly committed.
    pub fn map_memory(
        &self,
        range: &mut ApertureRange,
        pfns: &[PageFrameNumber],
        offset: usize,
    ) -> Result<PhysicalAddress, GartError> {
        if pfns.is_empty() || !range.contains(offset, pfns.len()) {
            return Err(GartError::InvalidParameter);
        }
        let bits = <C::Pte as PteFormat>::PFN_BITS;
        if pfns.iter().any(|p| !p.fits_in(bits)) {
            error!("Some pages are beyond the {bits}-bit frame limit");
            return Err(GartError::InvalidParameter);
        }

        let mut aperture = self.aperture.lock();
        let run = aperture.find_free_run(range, pfns.len(), offset);
        if run.offset != offset || run.len != pfns.len() {
            error!("Window at offset {offset} already contains committed pages");
            return Err(GartError::InvalidParameter);
        }
        let base = aperture.map_pages(range, pfns, offset)?;
        range.committed_pages += pfns.len();
        Ok(base)
    }

    /// Unmap pages previously mapped with [`map_memory`](Self::map_memory).
    ///
    /// The pages stay owned by the caller.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] if `pfns` is not exactly what is mapped
    /// at `offset`.
    pub fn unmap_memory(
        &self,
        range: &mut ApertureRange,
        pfns: &[PageFrameNumber],
        offset: usize,
    ) -> Result<(), GartError> {
        if pfns.is_empty() || offset >= range.pages() || !range.contains(offset, pfns.len()) {
            return Err(GartError::InvalidParameter);
        }

        let mut aperture = self.aperture.lock();
        let mapped = aperture.get_mapped_pages(range, pfns.len(), offset)?;
        if mapped != pfns {
            error!("Pages to unmap do not match the pages mapped at offset {offset}");
            return Err(GartError::InvalidParameter);
        }
        aperture.unmap_pages(range, pfns.len(), offset)?;

        debug_assert!(range.committed_pages >= pfns.len());
        range.committed_pages = range.committed_pages.saturating_sub(pfns.len());
        Ok(())
    }

    /// # Errors
    /// As [`Aperture::get_mapped_pages`].
    pub fn get_mapped_pages(
        &self,
        range: &ApertureRange,
        pages: usize,
        offset: usize,
    ) -> Result<Vec<PageFrameNumber>, GartError> {
        if offset >= range.pages() || !range.contains(offset, pages) {
            return Err(GartError::InvalidParameter);
        }
        self.aperture.lock().get_mapped_pages(range, pages, offset)
    }

    /// Change the transfer rate.
    ///
    /// The low nibble is the rate (0, 1, 2, 4 or 8);
    /// [`SET_RATE_DISABLE_SBA`] and [`SET_RATE_DISABLE_FW`] may be or-ed in.
    ///
    /// # Errors
    /// - [`GartError::InvalidParameter`] for an undefined rate, or for
    ///   disabling side band addressing in AGP 3.0 signalling.
    /// - As [`Aperture::special_target`].
    pub fn set_rate(&self, request: u32) -> Result<(), GartError> {
        let mut aperture = self.aperture.lock();
        let mut flags = SpecialTargetFlags::new();

        if request & SET_RATE_DISABLE_SBA != 0 {
            let master = aperture.platform_mut().master_capability()?;
            if master.is_agp3() {
                return Err(GartError::InvalidParameter);
            }
            flags.set_no_sba(true);
        }
        if request & SET_RATE_DISABLE_FW != 0 {
            flags.set_no_fast_write(true);
        }

        #[allow(clippy::cast_possible_truncation)]
        let rate = (request & SET_RATE_MASK) as u8;
        if !matches!(rate, 0 | 1 | 2 | 4 | 8) {
            return Err(GartError::InvalidParameter);
        }

        // The overrides shape the negotiation below, so record them first.
        aperture.special_target(flags)?;
        if rate == 0 {
            aperture.set_rate(0)
        } else {
            aperture.special_target(SpecialTargetFlags::new().with_set_rate(rate))
        }
    }

    /// # Errors
    /// As [`Aperture::special_target`].
    pub fn special_target(&self, flags: SpecialTargetFlags) -> Result<(), GartError> {
        self.aperture.lock().special_target(flags)
    }

    /// # Errors
    /// As [`Aperture::query_aperture`].
    pub fn query_aperture(&self) -> Result<ApertureInfo, GartError> {
        self.aperture.lock().query_aperture()
    }

    /// # Errors
    /// As [`Aperture::set_aperture`].
    pub fn set_aperture(&self, base: PhysicalAddress, pages: u64) -> Result<(), GartError> {
        self.aperture.lock().set_aperture(base, pages)
    }

    /// # Errors
    /// As [`Aperture::disable_aperture`].
    pub fn disable_aperture(&self) -> Result<(), GartError> {
        self.aperture.lock().disable_aperture()
    }

    /// The periodic verifier callback: corruption check, then configuration
    /// check.
    ///
    /// # Errors
    /// Bus failures while reading back the configuration.
    pub fn verifier_tick(&self) -> Result<VerifierTick, GartError> {
        let mut aperture = self.aperture.lock();
        let outcome = aperture.verifier_check();
        let drift = aperture.check_configuration()?;
        Ok(VerifierTick { outcome, drift })
    }
}
