use bitfield_struct::bitfield;

/// Data rate encodings used in [`AgpStatus::rate`] and [`AgpCommand::rate`].
///
/// In AGP 2.0 signalling the field is a bitmask of `RATE_1X | RATE_2X | RATE_4X`.
/// In AGP 3.0 mode (`agp3_mode` set in the target status) the same field
/// encodes `4X = 1` and `8X = 2`, i.e. the 2.0 encoding shifted right by two.
pub mod rate {
    pub const RATE_1X: u8 = 1;
    pub const RATE_2X: u8 = 2;
    pub const RATE_4X: u8 = 4;
    pub const RATE_8X: u8 = 8;

    /// Mask of the rate field in the registers.
    pub const RATE_MASK: u8 = 0b111;

    /// Whether `rate` is exactly one of the defined rates.
    #[must_use]
    pub const fn is_defined(rate: u8) -> bool {
        matches!(rate, RATE_1X | RATE_2X | RATE_4X | RATE_8X)
    }

    /// Convert a requested rate into the AGP 3.0 register encoding.
    ///
    /// Only 4X and 8X exist in AGP 3.0 mode.
    #[must_use]
    pub const fn to_agp3(rate: u8) -> Option<u8> {
        match rate {
            RATE_4X | RATE_8X => Some(rate >> 2),
            _ => None,
        }
    }
}

/// AGP status register (capability + 4, read-only).
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0–2   | `rate` supported rates |
/// | 3     | `agp3_mode` |
/// | 4     | `fast_write` |
/// | 5     | `four_gb` (addresses above 4 GiB) |
/// | 6     | `host_trans_disable` |
/// | 7     | `gart64` (64-bit GART entries) |
/// | 8     | `ita_coherent` |
/// | 9     | `side_band_addressing` |
/// | 10–12 | `calibration_cycle` |
/// | 13–15 | `async_request_size` |
/// | 17    | `isoch` |
/// | 24–31 | `request_queue_depth_maximum` |
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct AgpStatus {
    #[bits(3)]
    pub rate: u8,
    pub agp3_mode: bool,
    pub fast_write: bool,
    pub four_gb: bool,
    pub host_trans_disable: bool,
    pub gart64: bool,
    /// Target can snoop processor caches for coherent aperture traffic.
    pub ita_coherent: bool,
    pub side_band_addressing: bool,
    #[bits(3)]
    pub calibration_cycle: u8,
    #[bits(3)]
    pub async_request_size: u8,
    #[bits(1)]
    _reserved_16: u8,
    pub isoch: bool,
    #[bits(6)]
    _reserved_18_23: u8,
    pub request_queue_depth_maximum: u8,
}

/// AGP command register (capability + 8).
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0–2   | `rate` selected rate |
/// | 4     | `fast_write_enable` |
/// | 5     | `four_gb_enable` |
/// | 7     | `gart64` |
/// | 8     | `agp_enable` |
/// | 9     | `sba_enable` |
/// | 10–12 | `calibration_cycle` |
/// | 13–15 | `async_request_size` |
/// | 24–31 | `request_queue_depth` |
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct AgpCommand {
    #[bits(3)]
    pub rate: u8,
    #[bits(1)]
    _reserved_3: u8,
    pub fast_write_enable: bool,
    pub four_gb_enable: bool,
    #[bits(1)]
    _reserved_6: u8,
    pub gart64: bool,
    pub agp_enable: bool,
    pub sba_enable: bool,
    #[bits(3)]
    pub calibration_cycle: u8,
    #[bits(3)]
    pub async_request_size: u8,
    _reserved_16_23: u8,
    pub request_queue_depth: u8,
}

/// Snapshot of an AGP capability: status and command taken together.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AgpCapability {
    pub status: AgpStatus,
    pub command: AgpCommand,
}

impl AgpCapability {
    #[must_use]
    pub const fn new(status: AgpStatus, command: AgpCommand) -> Self {
        Self { status, command }
    }

    /// Whether the device signals AGP 3.0 mode.
    #[inline]
    #[must_use]
    pub const fn is_agp3(&self) -> bool {
        self.status.agp3_mode()
    }

    /// Whether the device is currently enabled.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.command.agp_enable()
    }
}
