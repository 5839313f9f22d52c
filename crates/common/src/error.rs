//! Central error type for the codec adapters (thiserror-based).

use thiserror::Error;

/// Error returned by every fallible adapter operation.
///
/// A decode call surfaces exactly one of these; collaborator failures are
/// mapped onto the closest variant at the point they occur.
#[derive(Error, Debug)]
pub enum NvpError {
    /// Malformed call arguments, or input that never yields a frame.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host or device memory could not be obtained.
    #[error("allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure { bytes: usize, reason: String },

    /// A host/device transfer failed.
    #[error("memory copy failed: {0}")]
    CopyFailure(String),

    /// The hardware parser or decoder rejected the input or failed internally.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The operation does not apply to this instance, or its configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The pixel-format conversion stage failed.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The cross-stream event handshake failed.
    #[error("stream synchronization failed: {0}")]
    Synchronization(String),

    /// The hardware decoder library or device runtime is not usable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl NvpError {
    /// Shorthand for [`NvpError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for [`NvpError::Decode`].
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// True for errors caused by the caller rather than the hardware.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Configuration(_))
    }
}

/// Convenience Result type for adapter operations.
pub type NvpResult<T> = Result<T, NvpError>;
