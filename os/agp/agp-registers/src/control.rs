use crate::{ExtendedTargetRegister, RegisterLocation, TargetRegister};
use agp_memory_addresses::PhysicalAddress;
use bitfield_struct::bitfield;

/// AGP 3.0 target control register (`CTRL`, extended capability + 0x10).
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct AgpControl {
    #[bits(7)]
    _reserved_0_6: u8,
    /// Bit 7: GART translation lookaside buffer enable.
    pub gtlb_enable: bool,
    /// Bit 8: aperture access enable.
    pub aperture_enable: bool,
    /// Bit 9: disable periodic calibration cycles.
    pub calibration_disable: bool,
    #[bits(22)]
    _reserved_10_31: u32,
}

impl TargetRegister for AgpControl {
    const LOCATION: RegisterLocation = RegisterLocation::Extended(ExtendedTargetRegister::Control);

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn into_raw(self) -> u32 {
        self.into_bits()
    }
}

/// Intel 440 `AGPCTRL` register (configuration offset `0xB0`).
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct AgpCtrl440 {
    #[bits(7)]
    _reserved_0_6: u8,
    /// Bit 7: GART TLB enable.
    pub gtlb_enable: bool,
    #[bits(24)]
    _reserved_8_31: u32,
}

impl TargetRegister for AgpCtrl440 {
    const LOCATION: RegisterLocation = RegisterLocation::Config {
        offset: 0xB0,
        width: 4,
    };

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn into_raw(self) -> u32 {
        self.into_bits()
    }
}

/// Intel 440 `NBXCFG` register (configuration offset `0x50`).
///
/// Only the aperture access global enable is modelled; every other bit is
/// preserved on read-modify-write.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct NbxCfg {
    #[bits(9)]
    _reserved_0_8: u16,
    /// Bit 9: aperture access global enable.
    pub aperture_enable: bool,
    #[bits(22)]
    _reserved_10_31: u32,
}

impl TargetRegister for NbxCfg {
    const LOCATION: RegisterLocation = RegisterLocation::Config {
        offset: 0x50,
        width: 4,
    };

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn into_raw(self) -> u32 {
        self.into_bits()
    }
}

/// Aperture base BAR (configuration offset `0x10`) of the target bridge.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct ApertureBase {
    /// Bit 0: I/O space indicator, always clear for the aperture.
    pub io_space: bool,
    #[bits(2)]
    pub kind: u8,
    pub prefetchable: bool,
    #[bits(28)]
    _base_31_4: u32,
}

impl ApertureBase {
    /// Aperture window base address with the flag bits masked off.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.into_bits() & !0xF) as u64)
    }
}

impl TargetRegister for ApertureBase {
    const LOCATION: RegisterLocation = RegisterLocation::Config {
        offset: 0x10,
        width: 4,
    };

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn into_raw(self) -> u32 {
        self.into_bits()
    }
}

/// Intel 440 `ATTBASE` register (configuration offset `0xB8`): physical
/// address of the GART.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AttBase440(pub u32);

impl TargetRegister for AttBase440 {
    const LOCATION: RegisterLocation = RegisterLocation::Config {
        offset: 0xB8,
        width: 4,
    };

    fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn into_raw(self) -> u32 {
        self.0
    }
}

/// Intel 440 `APSIZE` register (configuration offset `0xB4`, 8 bit).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ApSize440(pub u8);

impl TargetRegister for ApSize440 {
    const LOCATION: RegisterLocation = RegisterLocation::Config {
        offset: 0xB4,
        width: 1,
    };

    #[allow(clippy::cast_possible_truncation)]
    fn from_raw(raw: u32) -> Self {
        Self(raw as u8)
    }

    fn into_raw(self) -> u32 {
        u32::from(self.0)
    }
}

/// AGP 3.0 `APSIZE` register (extended capability + 0x14, 16 bit).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ApSize35(pub u16);

impl TargetRegister for ApSize35 {
    const LOCATION: RegisterLocation =
        RegisterLocation::Extended(ExtendedTargetRegister::ApertureSize);

    #[allow(clippy::cast_possible_truncation)]
    fn from_raw(raw: u32) -> Self {
        Self(raw as u16)
    }

    fn into_raw(self) -> u32 {
        u32::from(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bits() {
        let ctrl = AgpControl::new()
            .with_gtlb_enable(true)
            .with_aperture_enable(true);
        assert_eq!(ctrl.into_bits(), 0x180);
    }

    #[test]
    fn nbxcfg_preserves_unmodelled_bits() {
        let cfg = NbxCfg::from_bits(0xFF00_0001).with_aperture_enable(true);
        assert_eq!(cfg.into_bits(), 0xFF00_0201);
    }

    #[test]
    fn aperture_base_masks_flags() {
        let bar = ApertureBase::from_bits(0xE000_0008);
        assert!(bar.prefetchable());
        assert_eq!(bar.address().as_u64(), 0xE000_0000);
    }
}
