//! AGP transfer rate negotiation between master and target.
//!
//! Negotiation itself is pure ([`negotiate`]); [`apply`] wraps it in the
//! hardware sequence: read both capabilities, disable the target and then
//! the master, and only then write the new command words in the order the
//! chipset wants.

use crate::GartError;
use agp_registers::rate::{self as agp_rate, RATE_1X, RATE_2X, RATE_4X, RATE_MASK};
use agp_registers::{AgpBus, AgpCapability, AgpCommand, AgpStatus};
use bitfield_struct::bitfield;
use log::{debug, info, warn};

/// Chipset quirks, as carried by the bus driver's device tables.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct SpecialTargetFlags {
    /// Mask 1X out of the advertised rates (AGP 2.0 signalling only).
    pub no_1x: bool,
    /// Mask 2X out of the advertised rates (AGP 2.0 signalling only).
    pub no_2x: bool,
    pub no_4x: bool,
    /// Mask 8X out of the advertised rates (AGP 3.0 signalling only).
    pub no_8x: bool,
    /// Program the master before the target.
    pub reverse_init: bool,
    pub no_sba: bool,
    pub no_fast_write: bool,
    #[bits(1)]
    _reserved_7: u8,
    /// Rate to force, in AGP 2.0 notation (1, 2, 4 or 8); zero for none.
    #[bits(4)]
    pub set_rate: u8,
    /// Never clear the aperture enable, the chipset cannot take it back.
    pub no_aperture_disable: bool,
    /// Early VIA 8X silicon swaps the rate encodings in AGP 2.0 mode.
    pub via_agp2_rate_patch: bool,
    /// Never turn the GART TLB on.
    pub via_disable_gtlb: bool,
    #[bits(49)]
    _reserved_15_63: u64,
}

impl SpecialTargetFlags {
    /// Both flag sets combined; the forced rate of `other` wins if it has one.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        let rate = if other.set_rate() != 0 {
            other.set_rate()
        } else {
            self.set_rate()
        };
        Self::from_bits(self.into_bits() | other.into_bits()).with_set_rate(rate)
    }

    /// The same quirks without a forced rate.
    #[must_use]
    pub const fn without_rate(self) -> Self {
        self.with_set_rate(0)
    }
}

/// Mask quirky rates and features out of an advertised status.
#[must_use]
pub const fn apply_quirks(status: AgpStatus, quirks: SpecialTargetFlags) -> AgpStatus {
    let agp3 = status.agp3_mode();
    let mut rate = status.rate();
    let mut status = status;

    if quirks.no_1x() && !agp3 {
        rate &= !RATE_1X;
    }
    if quirks.no_2x() && !agp3 {
        rate &= !RATE_2X;
    }
    if quirks.no_4x() {
        // 4X is bit 0 in AGP 3.0 signalling.
        rate &= if agp3 { !RATE_1X } else { !RATE_4X };
    }
    if quirks.no_8x() && agp3 {
        rate &= !RATE_2X;
    }
    if quirks.no_sba() && !agp3 {
        status = status.with_side_band_addressing(false);
    }
    if quirks.no_fast_write() {
        status = status.with_fast_write(false);
    }
    status.with_rate(rate & RATE_MASK)
}

/// The fastest rate both sides support after quirks, in AGP 2.0 notation.
#[must_use]
pub const fn highest_common_rate(
    master: &AgpCapability,
    target: &AgpCapability,
    quirks: SpecialTargetFlags,
) -> Option<u8> {
    let common = apply_quirks(master.status, quirks).rate()
        & apply_quirks(target.status, quirks).rate()
        & RATE_MASK;
    if common == 0 {
        return None;
    }
    let highest = 1u8 << (u8::BITS - 1 - common.leading_zeros());
    if target.is_agp3() {
        Some(highest << 2)
    } else {
        Some(highest)
    }
}

/// Everything that shapes the command words besides the two capabilities.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateRequest {
    /// Requested rate in AGP 2.0 notation (1, 2, 4 or 8).
    pub rate: u8,
    pub quirks: SpecialTargetFlags,
    /// Enable addressing above 4 GiB on both sides.
    pub four_gb: bool,
    /// Tell the target the GART uses 64-bit entries.
    pub gart64: bool,
    /// Set the AGP enable bits even if they were clear before.
    pub force_enable: bool,
}

/// Command words produced by [`negotiate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub master: AgpCapability,
    pub target: AgpCapability,
    /// The rate in register encoding (AGP 3.0 encodings are shifted).
    pub rate: u8,
}

/// Compute the command words for `request`.
///
/// # Errors
/// [`GartError::InvalidParameter`] if the rate is not supported by both
/// sides, or is not 4X or 8X while the target signals AGP 3.0.
pub fn negotiate(
    master: &AgpCapability,
    target: &AgpCapability,
    request: &RateRequest,
) -> Result<Negotiated, GartError> {
    let master_status = apply_quirks(master.status, request.quirks);
    let target_status = apply_quirks(target.status, request.quirks);
    let agp3 = target_status.agp3_mode();

    let rate = if agp3 {
        debug_assert!(master_status.agp3_mode(), "AGP 3.0 target with an AGP 2.0 master");
        agp_rate::to_agp3(request.rate).ok_or(GartError::InvalidParameter)?
    } else {
        request.rate
    };
    if rate & master_status.rate() & target_status.rate() == 0 {
        return Err(GartError::InvalidParameter);
    }

    let sba = master_status.side_band_addressing() && target_status.side_band_addressing();
    let fast_write = master_status.fast_write() && target_status.fast_write();

    let mut master_command = master
        .command
        .with_rate(rate)
        .with_agp_enable(master.command.agp_enable() || request.force_enable)
        .with_sba_enable(sba)
        .with_fast_write_enable(fast_write)
        .with_four_gb_enable(request.four_gb)
        .with_request_queue_depth(target_status.request_queue_depth_maximum())
        .with_async_request_size(target_status.async_request_size());

    let mut target_command = target
        .command
        .with_rate(rate)
        .with_agp_enable(target.command.agp_enable() || request.force_enable)
        .with_sba_enable(sba)
        .with_fast_write_enable(fast_write)
        .with_four_gb_enable(request.four_gb)
        .with_gart64(request.gart64)
        .with_calibration_cycle(
            master_status
                .calibration_cycle()
                .min(target_status.calibration_cycle()),
        );

    if request.quirks.via_agp2_rate_patch() && !agp3 {
        match rate {
            RATE_1X | RATE_2X => {
                master_command = master_command.with_rate(RATE_1X);
                target_command = target_command.with_rate(RATE_4X);
            }
            RATE_4X => {
                master_command = master_command.with_rate(RATE_4X);
                target_command = target_command.with_rate(RATE_1X);
            }
            _ => {}
        }
        warn!("Applying VIA AGP 2.0 rate patch");
    }

    Ok(Negotiated {
        master: AgpCapability::new(master.status, master_command),
        target: AgpCapability::new(target.status, target_command),
        rate,
    })
}

/// Negotiate `request` and program both devices.
///
/// # Errors
/// Negotiation failures leave the hardware untouched; bus failures are
/// propagated as they happen.
pub fn apply<B: AgpBus>(bus: &mut B, request: &RateRequest) -> Result<Negotiated, GartError> {
    let target = bus.target_capability()?;
    let master = bus.master_capability()?;
    let negotiated = negotiate(&master, &target, request)?;

    disable(bus, target, master)?;

    if request.quirks.reverse_init() {
        debug!("Reverse initialization: programming master first");
        bus.set_master_capability(&negotiated.master)?;
        bus.set_target_capability(&negotiated.target)?;
    } else {
        bus.set_target_capability(&negotiated.target)?;
        bus.set_master_capability(&negotiated.master)?;
    }

    info!(
        "AGP rate {}X (register {:#x}), SBA {}, fast write {}, 4 GB {}",
        request.rate,
        negotiated.rate,
        negotiated.target.command.sba_enable(),
        negotiated.target.command.fast_write_enable(),
        request.four_gb
    );
    Ok(negotiated)
}

/// Clear the AGP enable bit on both devices and leave them off.
///
/// Returns the target command as written.
///
/// # Errors
/// Propagates bus failures.
pub fn quiesce<B: AgpBus>(bus: &mut B) -> Result<AgpCommand, GartError> {
    let target = bus.target_capability()?;
    let master = bus.master_capability()?;
    let command = disable(bus, target, master)?;
    info!("AGP disabled");
    Ok(command)
}

/// Target first, then master.
fn disable<B: AgpBus>(
    bus: &mut B,
    mut target: AgpCapability,
    mut master: AgpCapability,
) -> Result<AgpCommand, GartError> {
    target.command.set_agp_enable(false);
    bus.set_target_capability(&target)?;
    master.command.set_agp_enable(false);
    bus.set_master_capability(&master)?;
    Ok(target.command)
}
