//! # AGP GART Management
//!
//! Host-agnostic management of an AGP aperture and its Graphics Address
//! Remapping Table: the page table a host bridge walks to turn a contiguous
//! aperture window into scattered physical pages.
//!
//! ## What you get
//! - A [`GartEntry`] model and its hardware encodings ([`Gart32Pte`],
//!   [`Gart35Pte`], [`Gart64Pte`]).
//! - A [`GartTable`] that reserves ranges first-fit (uncached from the top,
//!   write-combined from the bottom) and maps page lists with a TLB bracket.
//! - A [`VerifierState`] that shadows the table and checks it for corruption.
//! - AGP [rate negotiation](rate) between master and target with chipset
//!   quirks.
//! - [`Chipset`] backends for [Intel 440](Intel440) and [AGP 3.5](Agp35)
//!   host bridges.
//! - An [`Aperture`] context tying it together, and the locked
//!   [`AgpInterface`] that graphics drivers talk to.
//!
//! ## Entry lifecycle
//!
//! ```text
//!            reserve              map
//!   Free ───────────► Reserved* ───────► Valid*
//!    ▲                  │   ▲               │
//!    └──────────────────┘   └───────────────┘
//!           release              unmap
//!
//!   Guard: installed at creation, never leaves.
//! ```
//!
//! ## Hardware and memory
//!
//! Configuration space goes through [`AgpBus`](agp_registers::AgpBus); memory
//! for the table through [`ContiguousAlloc`] and for committed pages through
//! [`PageAlloc`]. The opt-in `sim` feature adds `sim::SimPlatform`, which
//! implements all three in memory for tests and host-side tooling.
//!
//! ## Logging
//!
//! Everything logs through the [`log`] facade. The crate never installs a
//! logger.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod aperture;
pub mod chipset;
pub mod entry;
mod error;
mod guard;
pub mod interface;
pub mod platform;
pub mod rate;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod table;
pub mod verifier;

pub use crate::aperture::{Aperture, ApertureInfo, ConfigurationDrift};
pub use crate::chipset::{Agp35, Chipset, Intel440};
pub use crate::entry::{CacheType, EntryState, Gart32Pte, Gart35Pte, Gart64Pte, GartEntry, PteFormat};
pub use crate::error::GartError;
pub use crate::interface::{AgpInterface, Committed, VerifierTick};
pub use crate::platform::{ContiguousAlloc, ContiguousBlock, PageAlloc};
pub use crate::rate::SpecialTargetFlags;
pub use crate::table::{ApertureRange, EntryCounts, FreeRun, GartTable, TlbControl};
pub use crate::verifier::{
    CheckOutcome, CorruptionReport, FatalHandler, VerifierFlags, VerifierPhase, VerifierState,
};
