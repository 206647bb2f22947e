//! Chipset backends.
//!
//! A [`Chipset`] knows where its aperture and GART registers live and which
//! entry format its GART walker expects. Everything else (allocation, the
//! verifier, rate negotiation) is shared.

mod agp35;
mod i440;

pub use agp35::Agp35;
pub use i440::Intel440;

use crate::GartError;
use crate::entry::PteFormat;
use agp_memory_addresses::{PAGE_SHIFT, PhysicalAddress};
use agp_registers::{AgpBus, AgpCapability, ApertureSize};

pub trait Chipset {
    /// Entry format of the GART.
    type Pte: PteFormat;

    const NAME: &'static str;
    const MIN_APERTURE: ApertureSize = ApertureSize::Mb4;
    const MAX_APERTURE: ApertureSize;

    /// Check that the target is one this backend drives.
    ///
    /// # Errors
    /// [`GartError::NotSupported`] if it is not.
    fn probe<B: AgpBus>(&mut self, bus: &mut B, target: &AgpCapability) -> Result<(), GartError>;

    /// Current aperture base and size as programmed.
    ///
    /// # Errors
    /// [`GartError::NotSupported`] for a size encoding the backend cannot
    /// decode; bus failures.
    fn read_aperture<B: AgpBus>(&self, bus: &mut B) -> Result<(PhysicalAddress, ApertureSize), GartError>;

    /// # Errors
    /// [`GartError::InvalidParameter`] for a size the register cannot hold.
    fn write_aperture_size<B: AgpBus>(&self, bus: &mut B, size: ApertureSize) -> Result<(), GartError>;

    /// # Errors
    /// [`GartError::InvalidParameter`] for a base the register cannot hold.
    fn write_aperture_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError>;

    /// # Errors
    /// Propagates bus failures.
    fn aperture_enabled<B: AgpBus>(&self, bus: &mut B) -> Result<bool, GartError>;

    /// # Errors
    /// Propagates bus failures.
    fn set_aperture_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError>;

    /// # Errors
    /// Propagates bus failures.
    fn set_tlb_enabled<B: AgpBus>(&self, bus: &mut B, enable: bool) -> Result<(), GartError>;

    /// Point the chipset at the GART.
    ///
    /// # Errors
    /// [`GartError::InvalidParameter`] if the base is out of reach.
    fn program_gart_base<B: AgpBus>(&self, bus: &mut B, base: PhysicalAddress) -> Result<(), GartError>;

    /// First physical address the GART itself may not extend past.
    fn max_table_address(&self) -> u64 {
        1 << (<Self::Pte as PteFormat>::PFN_BITS + PAGE_SHIFT)
    }

    fn supports(&self, size: ApertureSize) -> bool {
        (Self::MIN_APERTURE..=Self::MAX_APERTURE).contains(&size)
    }

    /// Whether the target must be told about 64-bit entries.
    fn gart64(&self) -> bool {
        <Self::Pte as PteFormat>::BYTES == 8
    }
}
