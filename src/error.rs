//! Error taxonomy for the RPC client and the admission controller.

use std::fmt;
use thiserror::Error;

/// Error numbers used on the wire.
///
/// Values follow Linux errno numbering so that remote services and local
/// faults share one code space.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ECHILD: i32 = 10;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const EPROTO: i32 = 71;
    pub const ECONNRESET: i32 = 104;
}

/// Failure payload carried by a failed future.
///
/// `message` is absent when the failure is a bare status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub code: i32,
    pub message: Option<String>,
}

impl ErrorDescriptor {
    /// A bare error with no explanatory string.
    pub fn bare(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// An error with a human-readable message.
    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Whether a non-empty message is attached.
    pub fn has_message(&self) -> bool {
        self.message.as_deref().is_some_and(|m| !m.is_empty())
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message.as_deref() {
            Some(msg) if !msg.is_empty() => f.write_str(msg),
            _ => write!(f, "{}", std::io::Error::from_raw_os_error(self.code)),
        }
    }
}

/// Error type for every tether operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle cannot accept new requests.
    #[error("connection unavailable: {0}")]
    Connection(String),

    /// The request failed locally before a response arrived.
    #[error("local fault: {0}")]
    LocalFault(ErrorDescriptor),

    /// The remote side answered with an error.
    #[error("remote error: {0}")]
    Remote(ErrorDescriptor),

    /// The payload was not valid text or canonical JSON.
    #[error("failed to decode payload: {0}")]
    Decoding(String),

    /// A structured value could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encoding(String),

    /// Invalid admission controller parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// The failure descriptor, for errors that resolved a future.
    pub fn descriptor(&self) -> Option<&ErrorDescriptor> {
        match self {
            Error::LocalFault(desc) | Error::Remote(desc) => Some(desc),
            _ => None,
        }
    }

    /// The error code, for errors that resolved a future.
    pub fn code(&self) -> Option<i32> {
        self.descriptor().map(|d| d.code)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_display_prefers_message() {
        let desc = ErrorDescriptor::with_message(errno::EINVAL, "jobspec is empty");
        assert_eq!(desc.to_string(), "jobspec is empty");
    }

    #[test]
    fn test_bare_descriptor_falls_back_to_errno_text() {
        let desc = ErrorDescriptor::bare(errno::ENOSYS);
        assert!(!desc.has_message());
        assert!(!desc.to_string().is_empty());
    }

    #[test]
    fn test_empty_message_counts_as_bare() {
        let desc = ErrorDescriptor::with_message(errno::EPROTO, "");
        assert!(!desc.has_message());
    }

    #[test]
    fn test_code_only_for_resolution_errors() {
        assert_eq!(
            Error::Remote(ErrorDescriptor::bare(errno::ENOENT)).code(),
            Some(errno::ENOENT)
        );
        assert_eq!(Error::Connection("closed".into()).code(), None);
    }
}
