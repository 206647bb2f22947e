use super::Chipset;
use crate::GartError;
use crate::entry::Gart32Pte;
use agp_memory_addresses::PhysicalAddress;
use agp_registers::{
    AgpBus, AgpCapability, AgpCtrl440, ApSize440, ApertureBase, ApertureSize, AttBase440, NbxCfg,
};
use log::debug;

/// Intel 440BX/LX/GX host bridges.
///
/// Aperture size lives in `APSIZE` (0xB4), the GART base in `ATTBASE`
/// (0xB8), the TLB enable in `AGPCTRL` (0xB0) and the aperture enable in
/// `NBXCFG` (0x50). The GART must sit below 4 GiB.
#[derive(Debug, Default, Copy, Clone)]
pub struct Intel440;

impl Chipset for Intel440 {
    type Pte = Gart32Pte;

    const NAME: &'static str = "Intel 440";
    const MAX_APERTURE: ApertureSize = ApertureSize::Mb256;

    fn probe<B: AgpBus>(&mut self, _bus: &mut B, target: &AgpCapability) -> Result<(), GartError> {
        if target.is_agp3() {
            return Err(GartError::NotSupported);
        }
        Ok(())
    }

    fn read_aperture<B: AgpBus>(&self, bus: &mut B) -> Result<(PhysicalAddress, ApertureSize), GartError> {
        let base = bus.load::<ApertureBase>()?.address();
        let ApSize440(raw) = bus.load()?;
        let size = ApertureSize::from_i440(raw).ok_or(GartError::NotSupported)?;
        Ok((base, size))
    }

    fn write_aperture_size<B: AgpBus>(&self, bus: &mut B, size: ApertureSize) -> Result<(), GartError> {
        let raw = size.to_i440().ok_or(GartError::InvalidParameter)?;
        bus.store(ApSize440(raw))?;
        Ok(())
    }

    fn write_aperture_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError> {
        let (low, high) = base.split_u32();
        if high != 0 {
            return Err(GartError::InvalidParameter);
        }
        let flags = bus.load::<ApertureBase>()?.into_bits() & 0xF;
        bus.store(ApertureBase::from_bits(low | flags))?;
        Ok(())
    }

    fn aperture_enabled<B: AgpBus>(&self, bus: &mut B) -> Result<bool, GartError> {
        Ok(bus.load::<NbxCfg>()?.aperture_enable())
    }

    fn set_aperture_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError> {
        let cfg = bus.load::<NbxCfg>()?;
        bus.store(cfg.with_aperture_enable(enable))?;
        Ok(())
    }

    fn set_tlb_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError> {
        let ctrl = bus.load::<AgpCtrl440>()?;
        bus.store(ctrl.with_gtlb_enable(enable))?;
        Ok(())
    }

    fn program_gart_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError> {
        let (low, high) = base.split_u32();
        if high != 0 {
            return Err(GartError::InvalidParameter);
        }
        debug!("ATTBASE <- {base}");
        bus.store(AttBase440(low))?;
        Ok(())
    }
}
