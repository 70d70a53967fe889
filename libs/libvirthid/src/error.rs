//! Error taxonomy and wire status codes

use thiserror::Error;

use crate::marshal::MarshalError;

/// Errors returned to clients (and to the provider, for `notify`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or missing required argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Unknown selector, or a request whose shape does not match its selector
    #[error("Unsupported request: {0}")]
    Unsupported(&'static str),

    /// Client memory could not be prepared or mapped
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Provider rejected a well-formed request
    #[error("Device error: {0}")]
    DeviceError(&'static str),

    /// Caller broke a precondition of the operation
    #[error("Failed precondition: {0}")]
    FailedPrecondition(&'static str),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire status for this error
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::Unsupported(_) => Status::Unsupported,
            Self::ResourceExhausted(_) => Status::ResourceExhausted,
            Self::DeviceError(_) => Status::DeviceError,
            Self::FailedPrecondition(_) => Status::FailedPrecondition,
        }
    }

    /// Check if the request may succeed when repeated with the same arguments
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

impl From<MarshalError> for Error {
    fn from(err: MarshalError) -> Self {
        match err {
            MarshalError::NullAddress => Self::InvalidArgument("null buffer address"),
            MarshalError::ZeroLength => Self::InvalidArgument("zero buffer length"),
            MarshalError::LengthTooLarge => Self::InvalidArgument("buffer length too large"),
            MarshalError::AddressOverflow => Self::InvalidArgument("buffer range overflows"),
            MarshalError::PrepareFailed => Self::ResourceExhausted("buffer preparation failed"),
            MarshalError::MapFailed => Self::ResourceExhausted("buffer mapping failed"),
        }
    }
}

/// Status codes carried on the wire back to the client
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Success (not an error)
    Success = 0,
    /// Malformed or missing argument
    InvalidArgument = -1,
    /// Unknown or shape-mismatched selector
    Unsupported = -2,
    /// Buffer preparation or mapping failed
    ResourceExhausted = -3,
    /// Provider rejected the request
    DeviceError = -4,
    /// Notify without a live subscriber
    FailedPrecondition = -5,
}

impl Status {
    /// Raw wire value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Convert from a raw wire value
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            -1 => Self::InvalidArgument,
            -2 => Self::Unsupported,
            -3 => Self::ResourceExhausted,
            -4 => Self::DeviceError,
            -5 => Self::FailedPrecondition,
            _ => return None,
        })
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InvalidArgument => "invalid argument",
            Self::Unsupported => "unsupported",
            Self::ResourceExhausted => "resource exhausted",
            Self::DeviceError => "device error",
            Self::FailedPrecondition => "failed precondition",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
