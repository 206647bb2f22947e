//! GART entry model and its hardware encodings.
//!
//! A [`GartEntry`] is the software view of one page-table slot: a state tag
//! and the page frame it carries. The [`PteFormat`] implementations turn it
//! into the fixed-width word the chipset fetches, and back.
//!
//! ### Hardware-visible valid bit
//!
//! | State                | Verifier disabled      | Verifier armed                 |
//! |----------------------|------------------------|--------------------------------|
//! | `Valid*`             | `valid = 1`, real PFN  | `valid = 1`, real PFN          |
//! | `Free`, `Reserved*`, `Guard` | `valid = 0`, PFN 0 | `valid = 1`, sentinel PFN |
//!
//! With the verifier armed a stray hardware access through a nominally
//! unmapped slot lands on the sacrificial sentinel page instead of address 0.
//! The state tag lives in bits the chipset ignores, so decoding never needs
//! the verifier.

use crate::verifier::VerifierState;
use agp_memory_addresses::PageFrameNumber;
use bitfield_struct::bitfield;
use core::fmt;

/// Cache policy of an aperture reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheType {
    Uncached,
    WriteCombined,
    /// Snooped by the chipset; needs ITA coherent support in the target.
    Coherent,
}

/// State tag of a GART entry (3 bits in every format).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    Free = 0,
    ReservedUncached = 1,
    ReservedWriteCombined = 2,
    ReservedCoherent = 3,
    ValidUncached = 4,
    ValidWriteCombined = 5,
    ValidCoherent = 6,
    Guard = 7,
}

impl EntryState {
    /// Decode a 3-bit tag. Every value is a defined state.
    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value & 0b111 {
            0 => Self::Free,
            1 => Self::ReservedUncached,
            2 => Self::ReservedWriteCombined,
            3 => Self::ReservedCoherent,
            4 => Self::ValidUncached,
            5 => Self::ValidWriteCombined,
            6 => Self::ValidCoherent,
            _ => Self::Guard,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn reserved(cache: CacheType) -> Self {
        match cache {
            CacheType::Uncached => Self::ReservedUncached,
            CacheType::WriteCombined => Self::ReservedWriteCombined,
            CacheType::Coherent => Self::ReservedCoherent,
        }
    }

    #[must_use]
    pub const fn valid(cache: CacheType) -> Self {
        match cache {
            CacheType::Uncached => Self::ValidUncached,
            CacheType::WriteCombined => Self::ValidWriteCombined,
            CacheType::Coherent => Self::ValidCoherent,
        }
    }

    /// Cache policy of a reserved or valid state.
    #[must_use]
    pub const fn cache_type(self) -> Option<CacheType> {
        match self {
            Self::ReservedUncached | Self::ValidUncached => Some(CacheType::Uncached),
            Self::ReservedWriteCombined | Self::ValidWriteCombined => {
                Some(CacheType::WriteCombined)
            }
            Self::ReservedCoherent | Self::ValidCoherent => Some(CacheType::Coherent),
            Self::Free | Self::Guard => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::ReservedUncached | Self::ReservedWriteCombined | Self::ReservedCoherent
        )
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(
            self,
            Self::ValidUncached | Self::ValidWriteCombined | Self::ValidCoherent
        )
    }

    /// The reserved state an unmapped `Valid*` entry returns to.
    #[must_use]
    pub const fn unmapped(self) -> Self {
        match self {
            Self::ValidUncached => Self::ReservedUncached,
            Self::ValidWriteCombined => Self::ReservedWriteCombined,
            Self::ValidCoherent => Self::ReservedCoherent,
            other => other,
        }
    }
}

/// Software view of one GART slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct GartEntry {
    pub state: EntryState,
    pub page: PageFrameNumber,
}

impl GartEntry {
    /// A non-mapped entry in `state`, carrying the sentinel frame if the
    /// verifier is armed.
    #[must_use]
    pub fn unmapped(state: EntryState, verifier: &VerifierState) -> Self {
        debug_assert!(!state.is_valid());
        Self {
            state,
            page: verifier.sentinel().unwrap_or_default(),
        }
    }

    #[must_use]
    pub const fn mapped(cache: CacheType, page: PageFrameNumber) -> Self {
        Self {
            state: EntryState::valid(cache),
            page,
        }
    }

    #[must_use]
    pub fn free(verifier: &VerifierState) -> Self {
        Self::unmapped(EntryState::Free, verifier)
    }

    /// Whether the slot's page is the sentinel (or the verifier is off).
    fn parked(self, verifier: &VerifierState) -> bool {
        verifier.sentinel().is_none_or(|s| self.page == s)
    }

    /// Free and, with the verifier armed, pointing at the sentinel.
    #[must_use]
    pub fn is_free(self, verifier: &VerifierState) -> bool {
        self.state == EntryState::Free && self.parked(verifier)
    }

    /// Reserved as exactly `state` and not mapped.
    #[must_use]
    pub fn is_reserved_as(self, state: EntryState, verifier: &VerifierState) -> bool {
        debug_assert!(state.is_reserved());
        self.state == state && self.parked(verifier)
    }

    /// Reserved with any cache policy and not mapped.
    #[must_use]
    pub fn is_reserved(self, verifier: &VerifierState) -> bool {
        self.state.is_reserved() && self.parked(verifier)
    }

    /// Mapped to a real page.
    #[must_use]
    pub fn is_mapped(self, verifier: &VerifierState) -> bool {
        self.state.is_valid() && verifier.sentinel().is_none_or(|s| self.page != s)
    }
}

impl fmt::Debug for GartEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.state, self.page)
    }
}

/// A hardware page-table entry layout.
pub trait PteFormat: Copy + fmt::Debug + 'static {
    /// The word stored in the table.
    type Raw: Copy + Eq + Into<u64> + fmt::Debug + 'static;

    const NAME: &'static str;

    /// Width of the page frame field.
    const PFN_BITS: u32;

    /// Size in bytes of one stored entry.
    const BYTES: usize = size_of::<Self::Raw>();

    fn encode(entry: GartEntry, verifier: &VerifierState) -> Self::Raw;

    fn decode(raw: Self::Raw) -> GartEntry;
}

/// `(valid, page)` for the hardware half of an encoding.
fn hardware_view(entry: GartEntry, verifier: &VerifierState) -> (bool, u64) {
    if entry.state.is_valid() {
        (true, entry.page.as_u64())
    } else {
        match verifier.sentinel() {
            Some(sentinel) => (true, sentinel.as_u64()),
            None => (false, 0),
        }
    }
}

/// Classic 32-bit entry: 20-bit PFN in bits 12..=31 (Intel 440).
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Gart32Pte {
    pub valid: bool,
    #[bits(3)]
    pub state: EntryState,
    #[bits(8)]
    _reserved_4_11: u8,
    #[bits(20)]
    pub page: u32,
}

impl PteFormat for Gart32Pte {
    type Raw = u32;
    const NAME: &'static str = "gart32";
    const PFN_BITS: u32 = 20;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(entry: GartEntry, verifier: &VerifierState) -> u32 {
        let (valid, page) = hardware_view(entry, verifier);
        debug_assert!(PageFrameNumber::new(page).fits_in(Self::PFN_BITS));
        Self::new()
            .with_valid(valid)
            .with_state(entry.state)
            .with_page(page as u32)
            .into_bits()
    }

    fn decode(raw: u32) -> GartEntry {
        let pte = Self::from_bits(raw);
        GartEntry {
            state: pte.state(),
            page: PageFrameNumber::new(u64::from(pte.page())),
        }
    }
}

/// AGP 3.5 32-bit entry with the PFN split into a 20-bit low part in
/// bits 12..=31 and an 8-bit high part in bits 4..=11 (28-bit PFN).
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Gart35Pte {
    pub valid: bool,
    #[bits(3)]
    pub state: EntryState,
    pub page_high: u8,
    #[bits(20)]
    pub page_low: u32,
}

impl Gart35Pte {
    const PAGE_HIGH_SHIFT: u32 = 20;
    const PAGE_LOW_MASK: u64 = (1 << Self::PAGE_HIGH_SHIFT) - 1;
}

impl PteFormat for Gart35Pte {
    type Raw = u32;
    const NAME: &'static str = "gart35";
    const PFN_BITS: u32 = 28;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(entry: GartEntry, verifier: &VerifierState) -> u32 {
        let (valid, page) = hardware_view(entry, verifier);
        debug_assert!(PageFrameNumber::new(page).fits_in(Self::PFN_BITS));
        Self::new()
            .with_valid(valid)
            .with_state(entry.state)
            .with_page_low((page & Self::PAGE_LOW_MASK) as u32)
            .with_page_high((page >> Self::PAGE_HIGH_SHIFT) as u8)
            .into_bits()
    }

    fn decode(raw: u32) -> GartEntry {
        let pte = Self::from_bits(raw);
        let page = u64::from(pte.page_low()) | (u64::from(pte.page_high()) << Self::PAGE_HIGH_SHIFT);
        GartEntry {
            state: pte.state(),
            page: PageFrameNumber::new(page),
        }
    }
}

/// AGP 3.5 64-bit entry: 40-bit PFN in bits 12..=51.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Gart64Pte {
    pub valid: bool,
    #[bits(3)]
    pub state: EntryState,
    #[bits(8)]
    _reserved_4_11: u8,
    #[bits(40)]
    pub page: u64,
    #[bits(12)]
    _reserved_52_63: u16,
}

impl PteFormat for Gart64Pte {
    type Raw = u64;
    const NAME: &'static str = "gart64";
    const PFN_BITS: u32 = 40;

    fn encode(entry: GartEntry, verifier: &VerifierState) -> u64 {
        let (valid, page) = hardware_view(entry, verifier);
        debug_assert!(PageFrameNumber::new(page).fits_in(Self::PFN_BITS));
        Self::new()
            .with_valid(valid)
            .with_state(entry.state)
            .with_page(page)
            .into_bits()
    }

    fn decode(raw: u64) -> GartEntry {
        let pte = Self::from_bits(raw);
        GartEntry {
            state: pte.state(),
            page: PageFrameNumber::new(pte.page()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::VerifierFlags;

    const ALL_STATES: [EntryState; 8] = [
        EntryState::Free,
        EntryState::ReservedUncached,
        EntryState::ReservedWriteCombined,
        EntryState::ReservedCoherent,
        EntryState::ValidUncached,
        EntryState::ValidWriteCombined,
        EntryState::ValidCoherent,
        EntryState::Guard,
    ];

    fn verifiers() -> [VerifierState; 2] {
        let mut armed = VerifierState::disabled();
        armed
            .arm(
                VerifierFlags::new().with_corruption(true),
                PageFrameNumber::new(0x777),
            )
            .unwrap();
        [VerifierState::disabled(), armed]
    }

    fn sample(state: EntryState, verifier: &VerifierState) -> GartEntry {
        if state.is_valid() {
            GartEntry {
                state,
                page: PageFrameNumber::new(0x0AB_CDE),
            }
        } else {
            GartEntry::unmapped(state, verifier)
        }
    }

    fn round_trips<F: PteFormat>() {
        for verifier in &verifiers() {
            for state in ALL_STATES {
                let entry = sample(state, verifier);
                assert_eq!(F::decode(F::encode(entry, verifier)), entry, "{}", F::NAME);
            }
        }
    }

    #[test]
    fn decode_inverts_encode_for_every_state() {
        round_trips::<Gart32Pte>();
        round_trips::<Gart35Pte>();
        round_trips::<Gart64Pte>();
    }

    #[test]
    fn valid_bit_follows_verifier() {
        let [off, armed] = verifiers();
        let free_off = Gart32Pte::from_bits(Gart32Pte::encode(GartEntry::free(&off), &off));
        assert!(!free_off.valid());
        assert_eq!(free_off.page(), 0);

        let free_armed = Gart32Pte::from_bits(Gart32Pte::encode(GartEntry::free(&armed), &armed));
        assert!(free_armed.valid());
        assert_eq!(free_armed.page(), 0x777);

        let mapped = GartEntry::mapped(CacheType::Uncached, PageFrameNumber::new(0x1234));
        assert!(Gart32Pte::from_bits(Gart32Pte::encode(mapped, &off)).valid());
    }

    #[test]
    fn split_page_number_layout() {
        let off = VerifierState::disabled();
        let entry = GartEntry::mapped(CacheType::WriteCombined, PageFrameNumber::new(0xA5_12345));
        let raw = Gart35Pte::encode(entry, &off);
        let pte = Gart35Pte::from_bits(raw);
        assert_eq!(pte.page_low(), 0x12345);
        assert_eq!(pte.page_high(), 0xA5);
        assert_eq!(raw >> 12, 0x12345);
    }

    #[test]
    fn predicates_respect_sentinel() {
        let [off, armed] = verifiers();

        let free = GartEntry::free(&armed);
        assert!(free.is_free(&armed));
        assert!(free.is_free(&off));

        // A free tag pointing somewhere else is not free while armed.
        let stray = GartEntry {
            state: EntryState::Free,
            page: PageFrameNumber::new(1),
        };
        assert!(!stray.is_free(&armed));
        assert!(stray.is_free(&off));

        let reserved = GartEntry::unmapped(EntryState::ReservedWriteCombined, &armed);
        assert!(reserved.is_reserved_as(EntryState::ReservedWriteCombined, &armed));
        assert!(!reserved.is_reserved_as(EntryState::ReservedUncached, &armed));
        assert!(reserved.is_reserved(&armed));
        assert!(!reserved.is_mapped(&armed));

        let on_sentinel = GartEntry::mapped(CacheType::Uncached, PageFrameNumber::new(0x777));
        assert!(!on_sentinel.is_mapped(&armed));
        assert!(on_sentinel.is_mapped(&off));
    }

    #[test]
    fn unmapping_returns_to_matching_reservation() {
        for cache in [CacheType::Uncached, CacheType::WriteCombined, CacheType::Coherent] {
            assert_eq!(EntryState::valid(cache).unmapped(), EntryState::reserved(cache));
            assert_eq!(EntryState::valid(cache).cache_type(), Some(cache));
        }
        assert_eq!(EntryState::Guard.unmapped(), EntryState::Guard);
    }
}
