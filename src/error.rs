//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`DccError`] instead of a method-specific
//! error type; the RPC layer needs exactly one place (`DccError::message`) that turns an
//! error into the human-readable text the wire protocol carries.

/// A single crate-wide error enum, mirrored 1:1 onto the `status:"error"` kinds the RPC
/// dispatcher is contractually required to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DccError {
    /// Request line could not be parsed as a JSON object at all.
    #[error("Invalid JSON")]
    InvalidJson,
    /// Request parsed as JSON but was missing a required field or had the wrong shape.
    #[error("Malformed request")]
    Malformed,
    /// The `method` field was present but was not a JSON string.
    #[error("Method must be string")]
    MethodNotString,
    /// `method` does not match any entry in the dispatch table.
    #[error("Unknown method")]
    UnknownMethod,
    /// A parameter was present but out of range, the wrong type, or too long.
    #[error("Invalid argument")]
    InvalidArgument,
    /// `*_start` on an already-running subsystem, or `*_stop` on a stopped one.
    #[error("Busy")]
    Busy,
    /// An ADC mutex timeout or flash program/erase failure.
    #[error("Hardware fault")]
    HardwareFault,
    /// Flash payload CRC did not match the stored CRC.
    #[error("CRC mismatch")]
    CrcMismatch,
    /// Flash block magic number did not match.
    #[error("Magic mismatch")]
    MagicMismatch,
    /// Flash block version did not match the version this firmware expects.
    #[error("Version mismatch")]
    VersionMismatch,
}

impl DccError {
    /// The exact text the RPC dispatcher puts in a `message` field for this error.
    ///
    /// Kept distinct from [`core::fmt::Display`] (which `thiserror` already derives with the
    /// same strings here) so the wire-format text and the debug/log text are free to diverge
    /// later without touching call sites.
    pub const fn message(self) -> &'static str {
        match self {
            DccError::InvalidJson => "Invalid JSON",
            DccError::Malformed => "Malformed request",
            DccError::MethodNotString => "Method must be string",
            DccError::UnknownMethod => "Unknown method",
            DccError::InvalidArgument => "Invalid argument",
            DccError::Busy => "Busy",
            DccError::HardwareFault => "Hardware fault",
            DccError::CrcMismatch => "CRC mismatch",
            DccError::MagicMismatch => "Magic mismatch",
            DccError::VersionMismatch => "Version mismatch",
        }
    }
}
