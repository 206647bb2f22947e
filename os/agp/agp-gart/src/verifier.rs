//! GART corruption verifier.
//!
//! The verifier keeps a shadow copy of the table (allocated right behind
//! the primary entries) and periodically checks the primary region against
//! it. A cheap streaming checksum gates the expensive entry-by-entry compare:
//! an unchanged checksum means an unchanged table.
//!
//! Lifecycle: `Disabled -> Armed -> Running -> Disabled`. Arming requires a
//! sentinel page; every unmapped entry points at it while the verifier is
//! armed or running.

use crate::GartError;
use crate::entry::PteFormat;
use crate::table::GartTable;
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};
use bitfield_struct::bitfield;
use core::fmt;

/// Verifier feature selection.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct VerifierFlags {
    /// Watch the target command register for drift.
    pub configuration: bool,
    /// Park unmapped entries on the sentinel page.
    pub gart_access: bool,
    /// Surround the usable table with guard entries.
    pub guard: bool,
    /// Shadow the table and compare it on every check.
    pub corruption: bool,
    #[bits(28)]
    _reserved: u32,
}

impl VerifierFlags {
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifierPhase {
    Disabled,
    Armed,
    Running,
}

/// Per-aperture verifier state, passed explicitly into every table call.
#[derive(Debug, Clone)]
pub struct VerifierState {
    flags: VerifierFlags,
    sentinel: Option<PageFrameNumber>,
    checksum: u64,
    phase: VerifierPhase,
    comparisons: u64,
}

impl Default for VerifierState {
    fn default() -> Self {
        Self::disabled()
    }
}

impl VerifierState {
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            flags: VerifierFlags::new(),
            sentinel: None,
            checksum: 0,
            phase: VerifierPhase::Disabled,
            comparisons: 0,
        }
    }

    /// Assign the sentinel page and the feature flags.
    ///
    /// # Errors
    /// - [`GartError::InvalidDeviceState`] unless currently disabled.
    /// - [`GartError::InvalidParameter`] if `flags` selects nothing.
    pub fn arm(&mut self, flags: VerifierFlags, sentinel: PageFrameNumber) -> Result<(), GartError> {
        if self.phase != VerifierPhase::Disabled {
            return Err(GartError::InvalidDeviceState);
        }
        if flags.is_empty() {
            return Err(GartError::InvalidParameter);
        }
        self.flags = flags;
        self.sentinel = Some(sentinel);
        self.checksum = 0;
        self.phase = VerifierPhase::Armed;
        Ok(())
    }

    /// Begin periodic checking.
    ///
    /// # Errors
    /// [`GartError::InvalidDeviceState`] unless armed.
    pub fn start(&mut self) -> Result<(), GartError> {
        if self.phase != VerifierPhase::Armed {
            return Err(GartError::InvalidDeviceState);
        }
        self.phase = VerifierPhase::Running;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.flags = VerifierFlags::new();
        self.sentinel = None;
        self.checksum = 0;
        self.phase = VerifierPhase::Disabled;
    }

    /// Drop corruption checking after the shadow could not be allocated.
    pub(crate) fn degrade_corruption(&mut self) {
        self.flags.set_corruption(false);
    }

    pub(crate) fn forget_checksum(&mut self) {
        self.checksum = 0;
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> VerifierFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn phase(&self) -> VerifierPhase {
        self.phase
    }

    /// The page unmapped entries point at, `None` when disabled.
    #[inline]
    #[must_use]
    pub const fn sentinel(&self) -> Option<PageFrameNumber> {
        self.sentinel
    }

    #[inline]
    #[must_use]
    pub const fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Total entry comparisons performed so far.
    #[inline]
    #[must_use]
    pub const fn comparisons(&self) -> u64 {
        self.comparisons
    }

    #[inline]
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.phase, VerifierPhase::Running)
    }

    /// Run one corruption check against `table`.
    pub fn check<F: PteFormat>(&mut self, table: Option<&GartTable<F>>) -> CheckOutcome {
        if !self.flags.corruption() || !self.is_running() {
            return CheckOutcome::Skipped;
        }
        let Some(table) = table else {
            return CheckOutcome::Skipped;
        };
        if !table.has_shadow() {
            return CheckOutcome::Skipped;
        }

        let sum = table.checksum();
        if sum == self.checksum {
            return CheckOutcome::Unchanged;
        }

        for index in 0..table.len() {
            self.comparisons += 1;
            let found = table.raw(index);
            let expected = table.shadow_raw(index);
            if found != expected {
                // Only a clean compare may vouch for a checksum; a corrupted
                // table stays corrupted on every later check.
                self.forget_checksum();
                return CheckOutcome::Corrupted(CorruptionReport {
                    index,
                    entry_address: table.entry_address(index),
                    shadow_address: table.shadow_address(index),
                    found: found.into(),
                    expected: expected.into(),
                });
            }
        }
        self.checksum = sum;
        CheckOutcome::Verified
    }
}

/// Result of one [`VerifierState::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Corruption checking is off, not running, or there is no table.
    Skipped,
    /// Checksum unchanged; no entries compared.
    Unchanged,
    /// Full compare found the table intact.
    Verified,
    Corrupted(CorruptionReport),
}

/// Diagnostic context for a primary/shadow mismatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub index: usize,
    pub entry_address: PhysicalAddress,
    pub shadow_address: PhysicalAddress,
    pub found: u64,
    pub expected: u64,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GART entry {} at {} is {:#x}, shadow at {} holds {:#x}",
            self.index, self.entry_address, self.found, self.shadow_address, self.expected
        )
    }
}

/// Called with the report when a check finds corruption.
pub type FatalHandler = fn(&CorruptionReport);

/// Default [`FatalHandler`]: the table can no longer be trusted.
///
/// # Panics
/// Always.
pub fn panic_on_corruption(report: &CorruptionReport) {
    panic!("GART corrupted: {report}");
}

#[allow(clippy::cast_possible_truncation)]
const PERMUTATION: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }

    // Fisher-Yates shuffle driven by xorshift32.
    let mut state: u32 = 0x2545_F491;
    let mut i = 255;
    while i > 0 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let j = (state % (i as u32 + 1)) as usize;
        let tmp = table[i];
        table[i] = table[j];
        table[j] = tmp;
        i -= 1;
    }
    table
};

/// Eight-lane Pearson hash.
///
/// Each lane is a bijection of its previous value for a fixed input byte, so
/// changing any single byte always changes every lane.
#[derive(Debug, Clone)]
pub struct PearsonChecksum {
    lanes: [u8; 8],
}

impl Default for PearsonChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl PearsonChecksum {
    #[must_use]
    pub const fn new() -> Self {
        let mut lanes = [0u8; 8];
        let mut k = 0;
        while k < 8 {
            lanes[k] = PERMUTATION[k];
            k += 1;
        }
        Self { lanes }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            for lane in &mut self.lanes {
                *lane = PERMUTATION[usize::from(*lane ^ b)];
            }
        }
    }

    #[must_use]
    pub const fn finish(&self) -> u64 {
        u64::from_le_bytes(self.lanes)
    }
}
