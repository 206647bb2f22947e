//! # Aperture synchronization
//!
//! The GART algorithms are not reentrant: the free-range scan, the verifier's
//! running checksum and the TLB disable/enable bracket all assume a single
//! owner. [`ApertureLock`] is the one global lock every aperture operation is
//! serialized through.
//!
//! The lock is the kernel's test-and-test-and-set spin lock, kept as its own
//! crate so the GART manager does not pull in the kernel. Nothing done under
//! it blocks, and it is only ever taken from the interface layer, never
//! nested.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod aperture_lock;

pub use aperture_lock::{ApertureLock, ApertureLockGuard};
