use agp_memory_addresses::{PAGE_SHIFT, bytes_to_pages};

/// Aperture window sizes a chipset can be programmed for.
///
/// The 440 series only knows sizes up to 256 MiB; AGP 3.0 targets go up to
/// 2 GiB. The register encodings are masks over the address bits the bridge
/// decodes, so a larger aperture clears more bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApertureSize {
    Mb4,
    Mb8,
    Mb16,
    Mb32,
    Mb64,
    Mb128,
    Mb256,
    Mb512,
    Mb1024,
    Mb2048,
}

const MIB: u64 = 1024 * 1024;

impl ApertureSize {
    /// All sizes, smallest first.
    pub const ALL: [Self; 10] = [
        Self::Mb4,
        Self::Mb8,
        Self::Mb16,
        Self::Mb32,
        Self::Mb64,
        Self::Mb128,
        Self::Mb256,
        Self::Mb512,
        Self::Mb1024,
        Self::Mb2048,
    ];

    #[must_use]
    pub const fn megabytes(self) -> u64 {
        match self {
            Self::Mb4 => 4,
            Self::Mb8 => 8,
            Self::Mb16 => 16,
            Self::Mb32 => 32,
            Self::Mb64 => 64,
            Self::Mb128 => 128,
            Self::Mb256 => 256,
            Self::Mb512 => 512,
            Self::Mb1024 => 1024,
            Self::Mb2048 => 2048,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.megabytes() * MIB
    }

    /// Number of GART entries needed to back the window.
    #[inline]
    #[must_use]
    pub const fn pages(self) -> u64 {
        self.bytes() >> PAGE_SHIFT
    }

    /// The size matching `bytes` exactly.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        let mut i = 0;
        while i < Self::ALL.len() {
            if Self::ALL[i].bytes() == bytes {
                return Some(Self::ALL[i]);
            }
            i += 1;
        }
        None
    }

    /// The size matching a page count exactly.
    #[must_use]
    pub const fn from_pages(pages: u64) -> Option<Self> {
        let mut i = 0;
        while i < Self::ALL.len() {
            if bytes_to_pages(Self::ALL[i].bytes()) == pages {
                return Some(Self::ALL[i]);
            }
            i += 1;
        }
        None
    }

    /// AGP 3.0 `APSIZE` encoding.
    #[must_use]
    pub const fn to_agp3(self) -> u16 {
        match self {
            Self::Mb4 => 0xF3F,
            Self::Mb8 => 0xF3E,
            Self::Mb16 => 0xF3C,
            Self::Mb32 => 0xF38,
            Self::Mb64 => 0xF30,
            Self::Mb128 => 0xF20,
            Self::Mb256 => 0xF00,
            Self::Mb512 => 0xE00,
            Self::Mb1024 => 0xC00,
            Self::Mb2048 => 0x800,
        }
    }

    /// Decode an AGP 3.0 `APSIZE` value. Bits above the 12-bit field are ignored.
    #[must_use]
    pub const fn from_agp3(raw: u16) -> Option<Self> {
        match raw & 0xFFF {
            0xF3F => Some(Self::Mb4),
            0xF3E => Some(Self::Mb8),
            0xF3C => Some(Self::Mb16),
            0xF38 => Some(Self::Mb32),
            0xF30 => Some(Self::Mb64),
            0xF20 => Some(Self::Mb128),
            0xF00 => Some(Self::Mb256),
            0xE00 => Some(Self::Mb512),
            0xC00 => Some(Self::Mb1024),
            0x800 => Some(Self::Mb2048),
            _ => None,
        }
    }

    /// Intel 440 `APSIZE` encoding, `None` for sizes the 440 cannot decode.
    #[must_use]
    pub const fn to_i440(self) -> Option<u8> {
        match self {
            Self::Mb4 => Some(0x3F),
            Self::Mb8 => Some(0x3E),
            Self::Mb16 => Some(0x3C),
            Self::Mb32 => Some(0x38),
            Self::Mb64 => Some(0x30),
            Self::Mb128 => Some(0x20),
            Self::Mb256 => Some(0x00),
            Self::Mb512 | Self::Mb1024 | Self::Mb2048 => None,
        }
    }

    /// Decode an Intel 440 `APSIZE` value. Bits 6 and 7 are ignored.
    #[must_use]
    pub const fn from_i440(raw: u8) -> Option<Self> {
        match raw & 0x3F {
            0x3F => Some(Self::Mb4),
            0x3E => Some(Self::Mb8),
            0x3C => Some(Self::Mb16),
            0x38 => Some(Self::Mb32),
            0x30 => Some(Self::Mb64),
            0x20 => Some(Self::Mb128),
            0x00 => Some(Self::Mb256),
            _ => None,
        }
    }
}
