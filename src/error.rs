//! Error Module
//!
//! Error taxonomy shared by every stage of command construction and
//! submission.

use thiserror::Error;

use crate::protocol::*;

/// Errors surfaced by encoding, sizing, scheduling and status readback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// A semantic parameter struct failed a precondition.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A required resource handle is absent or unbound.
    #[error("missing resource: {0}")]
    MissingResource(String),

    /// Codec, surface format or generation combination is not implemented.
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    /// A unit of work cannot fit even after maximal buffer growth.
    #[error("unit of work needs {requested} bytes, ceiling is {ceiling}")]
    ExceedsMaximumSize { requested: usize, ceiling: usize },

    /// A pipe was built or submitted out of its declared order.
    #[error("synchronization contract violated: {0}")]
    SynchronizationContractViolation(String),

    /// Post-hoc error read back from the status buffer.
    #[error("hardware reported error flags 0x{flags:08X} ({affected_units} units affected)")]
    HardwareReportedError { flags: u32, affected_units: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;

impl MediaError {
    /// Numeric code reported alongside log lines and status records.
    pub fn code(&self) -> u32 {
        match self {
            MediaError::InvalidParameter(_) => MEDIA_ERROR_INVALID_PARAMETER,
            MediaError::MissingResource(_) => MEDIA_ERROR_MISSING_RESOURCE,
            MediaError::UnsupportedMode(_) => MEDIA_ERROR_UNSUPPORTED_MODE,
            MediaError::ExceedsMaximumSize { .. } => MEDIA_ERROR_EXCEEDS_MAXIMUM_SIZE,
            MediaError::SynchronizationContractViolation(_) => MEDIA_ERROR_SYNC_CONTRACT,
            MediaError::HardwareReportedError { .. } => MEDIA_ERROR_HARDWARE_REPORTED,
            MediaError::Config(_) => MEDIA_ERROR_CONFIG,
        }
    }

    /// Errors that poison the current frame and force the GPU context to be
    /// torn down before the next frame is configured.
    pub fn is_frame_fatal(&self) -> bool {
        matches!(
            self,
            MediaError::ExceedsMaximumSize { .. } | MediaError::SynchronizationContractViolation(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MediaError::InvalidParameter(msg.into())
    }

    pub(crate) fn missing(msg: impl Into<String>) -> Self {
        MediaError::MissingResource(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        MediaError::UnsupportedMode(msg.into())
    }

    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        MediaError::SynchronizationContractViolation(msg.into())
    }
}
