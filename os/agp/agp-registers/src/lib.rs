//! # Typed AGP Registers
//!
//! Register layouts for the AGP capability structure (PCI capability ID 2),
//! the AGP 3.0 extended target registers, and the Intel 440-series chipset
//! registers that control the aperture and its GART.
//!
//! Hardware access goes through the [`AgpBus`] trait: whoever owns the PCI
//! configuration space (a bus driver, a hypervisor, or a test double)
//! implements the raw byte accessors and gets typed [`load`](AgpBus::load) /
//! [`store`](AgpBus::store) for every [`TargetRegister`] for free.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod aperture_size;
pub mod capability;
pub mod control;

pub use crate::aperture_size::ApertureSize;
pub use crate::capability::{AgpCapability, AgpCommand, AgpStatus, rate};
pub use crate::control::{
    AgpControl, AgpCtrl440, ApSize35, ApSize440, ApertureBase, AttBase440, NbxCfg,
};

/// Failures of the configuration-space accessor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("configuration access at {offset:#x} (+{len}) is out of range")]
    OutOfRange { offset: u16, len: usize },
    #[error("device does not expose an AGP capability")]
    NoCapability,
    #[error("bus rejected the access")]
    Rejected,
}

/// Registers of the AGP 3.0 extended target capability block.
///
/// Offsets are relative to the AGP capability header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExtendedTargetRegister {
    /// `CTRL` (+0x10): GTLB and aperture enables.
    Control,
    /// `APSIZE` (+0x14): aperture size select (16 bit).
    ApertureSize,
    /// `GARTLO` (+0x18): low half of the GART base.
    GartLow,
    /// `GARTHI` (+0x1C): high half of the GART base.
    GartHigh,
}

impl ExtendedTargetRegister {
    /// Offset from the capability header.
    #[must_use]
    pub const fn offset(self) -> u16 {
        match self {
            Self::Control => 0x10,
            Self::ApertureSize => 0x14,
            Self::GartLow => 0x18,
            Self::GartHigh => 0x1C,
        }
    }
}

/// Where a [`TargetRegister`] lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterLocation {
    /// Plain configuration space of the target bridge.
    Config { offset: u16, width: usize },
    /// AGP 3.0 extended capability register.
    Extended(ExtendedTargetRegister),
}

/// A typed register of the AGP target (the host bridge).
pub trait TargetRegister: Copy {
    const LOCATION: RegisterLocation;

    fn from_raw(raw: u32) -> Self;

    fn into_raw(self) -> u32;
}

/// Configuration-space accessor for the AGP master (graphics device) and
/// target (host bridge).
///
/// Capability snapshots are read as a unit. The `set_*_capability` methods
/// write the **command** register only; the status register is read-only.
pub trait AgpBus {
    /// Read `buf.len()` bytes of target configuration space at `offset`.
    ///
    /// # Errors
    /// Returns [`BusError::OutOfRange`] if the access leaves configuration space.
    fn read_target_config(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), BusError>;

    /// Write `buf` into target configuration space at `offset`.
    ///
    /// # Errors
    /// Returns [`BusError::OutOfRange`] if the access leaves configuration space.
    fn write_target_config(&mut self, offset: u16, buf: &[u8]) -> Result<(), BusError>;

    /// # Errors
    /// [`BusError::NoCapability`] if the target has no AGP capability.
    fn target_capability(&mut self) -> Result<AgpCapability, BusError>;

    /// # Errors
    /// [`BusError::NoCapability`] if the master has no AGP capability.
    fn master_capability(&mut self) -> Result<AgpCapability, BusError>;

    /// # Errors
    /// Propagates bus failures.
    fn set_target_capability(&mut self, cap: &AgpCapability) -> Result<(), BusError>;

    /// # Errors
    /// Propagates bus failures.
    fn set_master_capability(&mut self, cap: &AgpCapability) -> Result<(), BusError>;

    /// # Errors
    /// [`BusError::NoCapability`] if the target is not AGP 3.0 capable.
    fn extended_target(&mut self, reg: ExtendedTargetRegister) -> Result<u32, BusError>;

    /// # Errors
    /// [`BusError::NoCapability`] if the target is not AGP 3.0 capable.
    fn set_extended_target(
        &mut self,
        reg: ExtendedTargetRegister,
        value: u32,
    ) -> Result<(), BusError>;

    /// Read a little-endian configuration value of `width` (1, 2 or 4) bytes.
    ///
    /// # Errors
    /// Propagates bus failures.
    fn read_target_value(&mut self, offset: u16, width: usize) -> Result<u32, BusError> {
        debug_assert!(matches!(width, 1 | 2 | 4));
        let mut bytes = [0u8; 4];
        self.read_target_config(offset, &mut bytes[..width])?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write the low `width` bytes of `value` little-endian.
    ///
    /// # Errors
    /// Propagates bus failures.
    fn write_target_value(&mut self, offset: u16, width: usize, value: u32) -> Result<(), BusError> {
        debug_assert!(matches!(width, 1 | 2 | 4));
        let bytes = value.to_le_bytes();
        self.write_target_config(offset, &bytes[..width])
    }

    /// Load a typed target register.
    ///
    /// # Errors
    /// Propagates bus failures.
    fn load<R: TargetRegister>(&mut self) -> Result<R, BusError>
    where
        Self: Sized,
    {
        let raw = match R::LOCATION {
            RegisterLocation::Config { offset, width } => self.read_target_value(offset, width)?,
            RegisterLocation::Extended(reg) => self.extended_target(reg)?,
        };
        Ok(R::from_raw(raw))
    }

    /// Store a typed target register.
    ///
    /// # Errors
    /// Propagates bus failures.
    fn store<R: TargetRegister>(&mut self, value: R) -> Result<(), BusError>
    where
        Self: Sized,
    {
        match R::LOCATION {
            RegisterLocation::Config { offset, width } => {
                self.write_target_value(offset, width, value.into_raw())
            }
            RegisterLocation::Extended(reg) => self.set_extended_target(reg, value.into_raw()),
        }
    }
}
