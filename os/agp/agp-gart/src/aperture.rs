//! The per-bus aperture context.
//!
//! [`Aperture`] owns the chipset backend, the platform services, the GART
//! (created lazily on the first reservation) and the verifier state. Every
//! method assumes the caller serializes access; [`AgpInterface`] does that
//! with an [`ApertureLock`].
//!
//! [`AgpInterface`]: crate::interface::AgpInterface
//! [`ApertureLock`]: agp_sync::ApertureLock

use crate::GartError;
use crate::chipset::Chipset;
use crate::entry::{CacheType, PteFormat};
use crate::platform::ContiguousAlloc;
use crate::rate::{self, RateRequest, SpecialTargetFlags, highest_common_rate};
use crate::table::{ApertureRange, EntryCounts, FreeRun, GartTable, TlbControl};
use crate::verifier::{
    CheckOutcome, FatalHandler, VerifierFlags, VerifierState, panic_on_corruption,
};
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress, is_aligned};
use agp_registers::{AgpBus, AgpCommand, ApertureSize};
use alloc::vec::Vec;
use log::{debug, error, info, warn};

/// Aperture placement as reported by [`Aperture::query_aperture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApertureInfo {
    pub base: PhysicalAddress,
    pub size: ApertureSize,
    /// Sizes the aperture may be reprogrammed to: the current size and every
    /// halving of it down to the chipset minimum, largest first.
    pub alternatives: Vec<ApertureSize>,
}

impl ApertureInfo {
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size.pages()
    }
}

/// The target command register no longer holds what was programmed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigurationDrift {
    pub expected: AgpCommand,
    pub found: AgpCommand,
}

/// Brackets table updates with the chipset's GTLB enable.
struct ChipsetTlb<'a, C, B> {
    chipset: &'a C,
    bus: &'a mut B,
    /// The chipset must never have its GTLB switched on.
    keep_disabled: bool,
}

impl<C: Chipset, B: AgpBus> TlbControl for ChipsetTlb<'_, C, B> {
    fn disable_tlb(&mut self) -> Result<(), GartError> {
        self.chipset.set_tlb_enabled(self.bus, false)
    }

    fn enable_tlb(&mut self) -> Result<(), GartError> {
        if self.keep_disabled {
            return Ok(());
        }
        self.chipset.set_tlb_enabled(self.bus, true)
    }
}

pub struct Aperture<C: Chipset, P: AgpBus + ContiguousAlloc> {
    chipset: C,
    platform: P,
    table: Option<GartTable<C::Pte>>,
    verifier: VerifierState,
    base: PhysicalAddress,
    size: Option<ApertureSize>,
    /// Software view of the aperture access enable.
    global_enable: bool,
    special: SpecialTargetFlags,
    /// Target supports coherent (ITA) traffic.
    coherent: bool,
    four_gb: bool,
    last_command: Option<AgpCommand>,
    fatal: FatalHandler,
}

impl<C: Chipset, P: AgpBus + ContiguousAlloc> Aperture<C, P> {
    /// An uninitialized context; call [`initialize`](Self::initialize) next.
    #[must_use]
    pub const fn new(chipset: C, platform: P) -> Self {
        Self {
            chipset,
            platform,
            table: None,
            verifier: VerifierState::disabled(),
            base: PhysicalAddress::zero(),
            size: None,
            global_enable: false,
            special: SpecialTargetFlags::new(),
            coherent: false,
            four_gb: false,
            last_command: None,
            fatal: panic_on_corruption,
        }
    }

    /// Quirks known before the hardware is touched. A forced rate here picks
    /// the rate [`initialize`](Self::initialize) programs.
    #[must_use]
    pub fn with_special_target(mut self, flags: SpecialTargetFlags) -> Self {
        self.special = self.special.merge(flags);
        self
    }

    /// Handler called when the verifier finds corruption.
    pub fn set_fatal_handler(&mut self, handler: FatalHandler) {
        self.fatal = handler;
    }

    /// Probe the target, read back the aperture the firmware set up, and
    /// bring AGP up at the forced or the fastest common rate.
    ///
    /// # Errors
    /// - [`GartError::NotSupported`] if the chipset backend rejects the
    ///   target or no common rate exists.
    /// - Negotiation and bus failures.
    pub fn initialize(&mut self) -> Result<ApertureInfo, GartError> {
        let target = self.platform.target_capability()?;
        self.chipset.probe(&mut self.platform, &target)?;
        let master = self.platform.master_capability()?;

        self.coherent = target.status.ita_coherent();
        self.four_gb = target.status.four_gb() && master.status.four_gb();
        self.global_enable = self.chipset.aperture_enabled(&mut self.platform)?;

        let rate = match self.special.set_rate() {
            0 => highest_common_rate(&master, &target, self.special).ok_or_else(|| {
                error!("{}: master and target share no transfer rate", C::NAME);
                GartError::NotSupported
            })?,
            forced => forced,
        };
        self.program_rate(rate, true)?;
        self.enable_tlb()?;

        let info = self.query_aperture()?;
        info!(
            "{}: aperture {} ({} MiB), {} GART, coherent {}, 4 GB {}",
            C::NAME,
            info.base,
            info.size.megabytes(),
            <C::Pte as PteFormat>::NAME,
            self.coherent,
            self.four_gb
        );
        Ok(info)
    }

    fn program_rate(&mut self, rate: u8, force_enable: bool) -> Result<(), GartError> {
        let request = RateRequest {
            rate,
            quirks: self.special,
            four_gb: self.four_gb,
            gart64: self.chipset.gart64(),
            force_enable,
        };
        let negotiated = rate::apply(&mut self.platform, &request)?;
        self.last_command = Some(negotiated.target.command);
        Ok(())
    }

    fn enable_tlb(&mut self) -> Result<(), GartError> {
        if self.special.via_disable_gtlb() {
            debug!("Leaving GTLB disabled");
            return Ok(());
        }
        self.chipset.set_tlb_enabled(&mut self.platform, true)
    }

    /// Read the aperture placement from the hardware.
    ///
    /// # Errors
    /// Bus failures, or a size encoding the backend does not know.
    pub fn query_aperture(&mut self) -> Result<ApertureInfo, GartError> {
        let (base, size) = self.chipset.read_aperture(&mut self.platform)?;
        self.base = base;
        self.size = Some(size);

        let alternatives = ApertureSize::ALL
            .iter()
            .rev()
            .copied()
            .filter(|&s| s <= size && self.chipset.supports(s))
            .collect();
        Ok(ApertureInfo {
            base,
            size,
            alternatives,
        })
    }

    /// Move and resize the aperture.
    ///
    /// # Errors
    /// - [`GartError::InvalidParameter`] for a size the chipset does not
    ///   support or a base not aligned to it.
    /// - [`GartError::InvalidDeviceState`] for a size change while a GART
    ///   exists.
    pub fn set_aperture(&mut self, base: PhysicalAddress, pages: u64) -> Result<(), GartError> {
        let size = ApertureSize::from_pages(pages)
            .filter(|&s| self.chipset.supports(s))
            .ok_or(GartError::InvalidParameter)?;
        if !is_aligned(base.as_u64(), size.bytes()) {
            return Err(GartError::InvalidParameter);
        }
        if self.table.is_some() && self.size != Some(size) {
            return Err(GartError::InvalidDeviceState);
        }

        // Reset the chipset's quirks; the rate stays as negotiated.
        self.special_target(self.special.without_rate())?;

        if self.chipset.aperture_enabled(&mut self.platform)? {
            if self.special.no_aperture_disable() {
                warn!("{}: reprogramming aperture without disabling it", C::NAME);
            } else {
                self.chipset.set_aperture_enabled(&mut self.platform, false)?;
            }
        }

        self.chipset.write_aperture_size(&mut self.platform, size)?;
        self.chipset.write_aperture_base(&mut self.platform, base)?;

        if self.global_enable {
            self.chipset.set_aperture_enabled(&mut self.platform, true)?;
        }
        self.base = base;
        self.size = Some(size);
        self.enable_tlb()?;

        if let Some(table) = &self.table {
            self.chipset
                .program_gart_base(&mut self.platform, table.physical_base())?;
        }

        info!("{}: aperture moved to {base} ({} MiB)", C::NAME, size.megabytes());
        Ok(())
    }

    /// Turn aperture access off and free the GART.
    ///
    /// With the `no_aperture_disable` quirk the hardware enable is left alone
    /// and the software view keeps reporting it enabled.
    ///
    /// # Errors
    /// Propagates bus failures.
    pub fn disable_aperture(&mut self) -> Result<(), GartError> {
        if self.special.no_aperture_disable() {
            warn!("{}: leaving aperture enabled", C::NAME);
        } else {
            self.chipset.set_aperture_enabled(&mut self.platform, false)?;
            self.global_enable = false;
        }
        self.free_table();
        Ok(())
    }

    fn free_table(&mut self) {
        if let Some(table) = self.table.take() {
            // Safety: the table was created with this platform.
            unsafe { table.destroy(&mut self.platform) };
            self.verifier.forget_checksum();
        }
    }

    fn create_table(&mut self, size: ApertureSize) -> Result<(), GartError> {
        let table = GartTable::<C::Pte>::create(
            &mut self.platform,
            size.bytes(),
            self.chipset.max_table_address(),
            &mut self.verifier,
        )?;
        if let Err(e) = self
            .chipset
            .program_gart_base(&mut self.platform, table.physical_base())
        {
            // Safety: created with this platform just above.
            unsafe { table.destroy(&mut self.platform) };
            return Err(e);
        }
        self.table = Some(table);
        Ok(())
    }

    /// Reserve `pages` contiguous aperture pages.
    ///
    /// # Errors
    /// - [`GartError::InvalidDeviceState`] before the aperture is known.
    /// - [`GartError::NotSupported`] for coherent memory on a target
    ///   without coherent support.
    /// - [`GartError::InsufficientResources`] if the aperture is too small,
    ///   fragmented, or the GART cannot be allocated.
    pub fn reserve(&mut self, pages: usize, cache: CacheType) -> Result<ApertureRange, GartError> {
        let size = self.size.ok_or(GartError::InvalidDeviceState)?;
        if cache == CacheType::Coherent && !self.coherent {
            warn!("{}: target does not support coherent memory", C::NAME);
            return Err(GartError::NotSupported);
        }
        if pages as u64 > size.pages() {
            return Err(GartError::InsufficientResources);
        }
        if self.table.is_none() {
            self.create_table(size)?;
        }
        let table = self.table.as_mut().ok_or(GartError::InvalidDeviceState)?;
        table.reserve(pages, cache, self.base, &self.verifier)
    }

    /// Return a reservation to the free pool.
    ///
    /// A range whose GART has since been freed is only marked released.
    pub fn release(&mut self, range: &mut ApertureRange) {
        if let Some(table) = self.table.as_mut() {
            table.release(range, &self.verifier);
        } else {
            warn!("{}: releasing a range without a GART", C::NAME);
            range.retire();
        }
    }

    /// Map `pages` into `range` at `offset`; see [`GartTable::map_pages`].
    ///
    /// The first successful map turns aperture access on.
    ///
    /// # Errors
    /// [`GartError::InvalidDeviceState`] without a GART, otherwise as
    /// [`GartTable::map_pages`].
    pub fn map_pages(
        &mut self,
        range: &ApertureRange,
        pages: &[PageFrameNumber],
        offset: usize,
    ) -> Result<PhysicalAddress, GartError> {
        let table = self.table.as_mut().ok_or(GartError::InvalidDeviceState)?;
        let mut tlb = ChipsetTlb {
            chipset: &self.chipset,
            bus: &mut self.platform,
            keep_disabled: self.special.via_disable_gtlb(),
        };
        let base = table.map_pages(&mut tlb, range, pages, offset, &self.verifier)?;

        if !self.global_enable {
            self.chipset.set_aperture_enabled(&mut self.platform, true)?;
            self.global_enable = true;
            debug!("{}: aperture access enabled", C::NAME);
        }
        Ok(base)
    }

    /// # Errors
    /// [`GartError::InvalidDeviceState`] without a GART, otherwise as
    /// [`GartTable::unmap_pages`].
    pub fn unmap_pages(
        &mut self,
        range: &ApertureRange,
        count: usize,
        offset: usize,
    ) -> Result<(), GartError> {
        let table = self.table.as_mut().ok_or(GartError::InvalidDeviceState)?;
        let mut tlb = ChipsetTlb {
            chipset: &self.chipset,
            bus: &mut self.platform,
            keep_disabled: self.special.via_disable_gtlb(),
        };
        table.unmap_pages(&mut tlb, range, count, offset, &self.verifier)
    }

    #[must_use]
    pub fn find_free_run(&self, range: &ApertureRange, count: usize, offset: usize) -> FreeRun {
        self.table
            .as_ref()
            .map(|t| t.find_free_run(range, count, offset, &self.verifier))
            .unwrap_or_default()
    }

    /// # Errors
    /// [`GartError::InvalidDeviceState`] without a GART, otherwise as
    /// [`GartTable::get_mapped_pages`].
    pub fn get_mapped_pages(
        &self,
        range: &ApertureRange,
        count: usize,
        offset: usize,
    ) -> Result<Vec<PageFrameNumber>, GartError> {
        let table = self.table.as_ref().ok_or(GartError::InvalidDeviceState)?;
        table.get_mapped_pages(range, count, offset, &self.verifier)
    }

    /// Apply chipset quirks at runtime.
    ///
    /// A forced rate in `flags` is programmed first; the flags are only
    /// recorded if that succeeds.
    ///
    /// # Errors
    /// As [`set_rate`](Self::set_rate).
    pub fn special_target(&mut self, flags: SpecialTargetFlags) -> Result<(), GartError> {
        if flags.set_rate() != 0 {
            self.set_rate(flags.set_rate())?;
        }
        self.special = self.special.merge(flags);
        Ok(())
    }

    /// Renegotiate the transfer rate. Rate 0 turns AGP off altogether.
    ///
    /// # Errors
    /// - [`GartError::InvalidDeviceState`] when disabling with reservations
    ///   outstanding.
    /// - [`GartError::InvalidParameter`] for a rate the devices do not share.
    pub fn set_rate(&mut self, rate: u8) -> Result<(), GartError> {
        if rate != 0 {
            return self.program_rate(rate, false);
        }

        if let Some(table) = &self.table {
            let outstanding = table.counts().outstanding();
            if outstanding > 0 {
                error!("{}: cannot disable AGP with {outstanding} entries in use", C::NAME);
                return Err(GartError::InvalidDeviceState);
            }
        }
        self.disable_aperture()?;
        self.last_command = Some(rate::quiesce(&mut self.platform)?);
        Ok(())
    }

    /// Arm the verifier with `flags` and the page stray accesses land on.
    ///
    /// # Errors
    /// - [`GartError::InvalidDeviceState`] once a GART exists or the
    ///   verifier is already armed.
    /// - [`GartError::InvalidParameter`] for an empty flag set or a sentinel
    ///   the entry format cannot address.
    pub fn arm_verifier(
        &mut self,
        flags: VerifierFlags,
        sentinel: PageFrameNumber,
    ) -> Result<(), GartError> {
        if self.table.is_some() {
            return Err(GartError::InvalidDeviceState);
        }
        if !sentinel.fits_in(<C::Pte as PteFormat>::PFN_BITS) {
            return Err(GartError::InvalidParameter);
        }
        self.verifier.arm(flags, sentinel)?;
        info!("GART verifier armed, sentinel {sentinel}");
        Ok(())
    }

    /// # Errors
    /// [`GartError::InvalidDeviceState`] unless armed.
    pub fn start_verifier(&mut self) -> Result<(), GartError> {
        self.verifier.start()
    }

    pub fn shutdown_verifier(&mut self) {
        self.verifier.shutdown();
        info!("GART verifier shut down");
    }

    /// One corruption check. Corruption is logged and handed to the fatal
    /// handler before being returned.
    pub fn verifier_check(&mut self) -> CheckOutcome {
        let outcome = self.verifier.check(self.table.as_ref());
        if let CheckOutcome::Corrupted(report) = &outcome {
            error!("GART corruption detected: {report}");
            (self.fatal)(report);
        }
        outcome
    }

    /// Compare the target command register with what was last programmed.
    ///
    /// # Errors
    /// Propagates bus failures.
    pub fn check_configuration(&mut self) -> Result<Option<ConfigurationDrift>, GartError> {
        if !self.verifier.flags().configuration() || !self.verifier.is_running() {
            return Ok(None);
        }
        let Some(expected) = self.last_command else {
            return Ok(None);
        };
        let found = self.platform.target_capability()?.command;
        if found == expected {
            return Ok(None);
        }
        warn!(
            "AGP target command drifted: expected {:#010x}, found {:#010x}",
            expected.into_bits(),
            found.into_bits()
        );
        Ok(Some(ConfigurationDrift { expected, found }))
    }

    #[must_use]
    pub const fn verifier(&self) -> &VerifierState {
        &self.verifier
    }

    #[must_use]
    pub const fn table(&self) -> Option<&GartTable<C::Pte>> {
        self.table.as_ref()
    }

    /// Entry counts, all zero without a GART.
    #[must_use]
    pub fn counts(&self) -> EntryCounts {
        self.table.as_ref().map(GartTable::counts).unwrap_or_default()
    }

    #[must_use]
    pub const fn chipset(&self) -> &C {
        &self.chipset
    }

    #[must_use]
    pub const fn special(&self) -> SpecialTargetFlags {
        self.special
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.global_enable
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> Option<ApertureSize> {
        self.size
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}

impl<C: Chipset, P: AgpBus + ContiguousAlloc> Drop for Aperture<C, P> {
    fn drop(&mut self) {
        self.free_table();
    }
}
