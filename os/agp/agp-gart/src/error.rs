use agp_registers::BusError;

/// Failures of aperture and GART operations.
///
/// Corruption found by the verifier is not an error; see
/// [`CorruptionReport`](crate::verifier::CorruptionReport).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GartError {
    /// Memory for the table, a reservation, or committed pages is exhausted.
    #[error("insufficient resources")]
    InsufficientResources,
    /// The request itself is malformed.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The request is well formed but not valid in the current state.
    #[error("invalid device state")]
    InvalidDeviceState,
    /// The chipset cannot do what was asked.
    #[error("operation not supported by the chipset")]
    NotSupported,
    #[error(transparent)]
    Bus(#[from] BusError),
}
