use super::Chipset;
use crate::GartError;
use crate::entry::{Gart35Pte, PteFormat};
use agp_memory_addresses::PhysicalAddress;
use agp_registers::{
    AgpBus, AgpCapability, AgpControl, ApSize35, ApertureBase, ApertureSize, BusError,
    ExtendedTargetRegister,
};
use core::marker::PhantomData;
use log::debug;

/// Upper half of a 64-bit aperture BAR.
const APERTURE_BASE_HIGH: u16 = 0x14;

/// AGP 3.5 compliant host bridges.
///
/// Aperture size, TLB and aperture enables and the GART base all live in the
/// extended target capability. `F` selects the entry format: the split
/// 28-bit [`Gart35Pte`] by default, or
/// [`Gart64Pte`](crate::entry::Gart64Pte) on targets that advertise 64-bit
/// GART entries.
#[derive(Debug, Copy, Clone)]
pub struct Agp35<F: PteFormat = Gart35Pte> {
    /// Aperture may be placed above 4 GiB.
    four_gb: bool,
    _format: PhantomData<F>,
}

impl<F: PteFormat> Default for Agp35<F> {
    fn default() -> Self {
        Self {
            four_gb: false,
            _format: PhantomData,
        }
    }
}

impl<F: PteFormat> Agp35<F> {
    #[must_use]
    pub const fn four_gb(&self) -> bool {
        self.four_gb
    }
}

impl<F: PteFormat> Chipset for Agp35<F> {
    type Pte = F;

    const NAME: &'static str = "AGP 3.5";
    const MAX_APERTURE: ApertureSize = ApertureSize::Mb2048;

    fn probe<B: AgpBus>(&mut self, bus: &mut B, target: &AgpCapability) -> Result<(), GartError> {
        match bus.extended_target(ExtendedTargetRegister::Control) {
            Ok(_) => {}
            Err(BusError::NoCapability) => return Err(GartError::NotSupported),
            Err(e) => return Err(e.into()),
        }
        if F::BYTES == 8 && !target.status.gart64() {
            return Err(GartError::NotSupported);
        }
        self.four_gb = target.status.four_gb();
        Ok(())
    }

    fn read_aperture<B: AgpBus>(&self, bus: &mut B) -> Result<(PhysicalAddress, ApertureSize), GartError> {
        let mut base = bus.load::<ApertureBase>()?.address().as_u64();
        if self.four_gb {
            base |= u64::from(bus.read_target_value(APERTURE_BASE_HIGH, 4)?) << 32;
        }
        let ApSize35(raw) = bus.load()?;
        let size = ApertureSize::from_agp3(raw).ok_or(GartError::NotSupported)?;
        Ok((PhysicalAddress::new(base), size))
    }

    fn write_aperture_size<B: AgpBus>(&self, bus: &mut B, size: ApertureSize) -> Result<(), GartError> {
        bus.store(ApSize35(size.to_agp3()))?;
        Ok(())
    }

    fn write_aperture_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError> {
        let (low, high) = base.split_u32();
        if high != 0 && !self.four_gb {
            return Err(GartError::InvalidParameter);
        }
        let flags = bus.load::<ApertureBase>()?.into_bits() & 0xF;
        bus.store(ApertureBase::from_bits(low | flags))?;
        if self.four_gb {
            bus.write_target_value(APERTURE_BASE_HIGH, 4, high)?;
        }
        Ok(())
    }

    fn aperture_enabled<B: AgpBus>(&self, bus: &mut B) -> Result<bool, GartError> {
        Ok(bus.load::<AgpControl>()?.aperture_enable())
    }

    fn set_aperture_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError> {
        let ctrl = bus.load::<AgpControl>()?;
        bus.store(ctrl.with_aperture_enable(enable))?;
        Ok(())
    }

    fn set_tlb_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError> {
        let ctrl = bus.load::<AgpControl>()?;
        bus.store(ctrl.with_gtlb_enable(enable))?;
        Ok(())
    }

    fn program_gart_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError> {
        let (low, high) = base.split_u32();
        debug!("GARTLO/GARTHI <- {base}");
        bus.set_extended_target(ExtendedTargetRegister::GartLow, low)?;
        bus.set_extended_target(ExtendedTargetRegister::GartHigh, high)?;
        Ok(())
    }
}
