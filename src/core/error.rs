use thiserror::Error;

use super::types::FrameKind;

/// Custom error types for the smart cell network stack
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing required reference: {0}")]
    NullReference(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource busy")]
    Busy,

    #[error("Operation failed: {0}")]
    GenericFailure(String),

    #[error("Empty frame buffer")]
    NullInput,

    #[error("Undefined frame type: {0:#04x}")]
    UndefinedFrameType(u8),

    #[error("Invalid length for {kind:?} frame: expected {expected}, got {actual}")]
    InvalidLength {
        /// Frame kind taken from the discriminant byte
        kind: FrameKind,
        /// Length the kind requires
        expected: usize,
        /// Length that was presented
        actual: usize,
    },

    #[error("Invalid short address: {0:#06x}")]
    InvalidAddress(u16),
}

/// Coarse error classification shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required buffer or reference was missing
    NullReference,
    /// Wrong size, out-of-range value or malformed frame
    InvalidParameter,
    /// Resource already in use
    Busy,
    /// Operation-specific failure without a finer classification
    GenericFailure,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::GenericFailure(e.to_string())
    }
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Creates a new generic failure
    pub fn failure(msg: impl Into<String>) -> Self {
        Error::GenericFailure(msg.into())
    }

    /// Creates a new storage failure
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::GenericFailure(format!("storage: {}", msg.into()))
    }

    /// Creates a new schedule failure
    pub fn schedule(msg: impl Into<String>) -> Self {
        Error::GenericFailure(format!("schedule: {}", msg.into()))
    }

    /// Creates a new link failure
    pub fn link(msg: impl Into<String>) -> Self {
        Error::GenericFailure(format!("link: {}", msg.into()))
    }

    /// Classifies this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NullReference(_) | Error::NullInput => ErrorKind::NullReference,
            Error::InvalidParameter(_)
            | Error::UndefinedFrameType(_)
            | Error::InvalidLength { .. }
            | Error::InvalidAddress(_) => ErrorKind::InvalidParameter,
            Error::Busy => ErrorKind::Busy,
            Error::GenericFailure(_) => ErrorKind::GenericFailure,
        }
    }

    /// Returns true if the link rejected a send because its slot was taken
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}
