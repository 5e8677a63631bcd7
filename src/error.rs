//! # Error Types
//!
//! Every failure that crosses the public API is one of the kinds below.
//! Backends translate their OS-level errors (`errno`, `std::io::Error`,
//! `rusb::Error`) into these kinds before returning.
//!
//! ## Legacy Codes
//!
//! The C `libstario` API reports errors as negative integers. Callers that
//! bridge to it can use [`StarIoError::code`]:
//!
//! | Kind | Code |
//! |------|------|
//! | `NotOpen` | -1 |
//! | `IoFail` | -2 |
//! | `NotAvailable` | -3 |
//! | `Rejected` (DLE) | -4 |
//! | `Nak` | -5 |
//! | `NoResponse` | -6 |
//! | `Runtime` | -7 |

use thiserror::Error;

/// Main error type for stario operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StarIoError {
    /// Port unknown, not open, or the device is no longer present
    #[error("Port not open: {0}")]
    NotOpen(String),

    /// Transport-level I/O failure, short status block, checksum mismatch
    #[error("I/O failure: {0}")]
    IoFail(String),

    /// Operation unsupported by this transport or firmware, or bad settings
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Device refused the command with DLE
    #[error("Command rejected by device (DLE)")]
    Rejected,

    /// Device kept answering NAK until the time budget ran out
    #[error("Command not acknowledged (NAK)")]
    Nak,

    /// Device did not answer within the time budget
    #[error("No response from device")]
    NoResponse,

    /// Internal resource failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Another operation is in flight on the same port
    #[error("Port busy: {0}")]
    Busy(String),
}

impl StarIoError {
    /// Numeric code used by the C `libstario` API.
    ///
    /// `Busy` has no legacy counterpart and reports as `Runtime`.
    pub fn code(&self) -> i64 {
        match self {
            StarIoError::NotOpen(_) => -1,
            StarIoError::IoFail(_) => -2,
            StarIoError::NotAvailable(_) => -3,
            StarIoError::Rejected => -4,
            StarIoError::Nak => -5,
            StarIoError::NoResponse => -6,
            StarIoError::Runtime(_) | StarIoError::Busy(_) => -7,
        }
    }

    /// True for the "port gone" kind.
    pub fn is_not_open(&self) -> bool {
        matches!(self, StarIoError::NotOpen(_))
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        StarIoError::IoFail(format!("{}: {}", context, err))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StarIoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_codes() {
        assert_eq!(StarIoError::NotOpen("x".into()).code(), -1);
        assert_eq!(StarIoError::IoFail("x".into()).code(), -2);
        assert_eq!(StarIoError::NotAvailable("x".into()).code(), -3);
        assert_eq!(StarIoError::Rejected.code(), -4);
        assert_eq!(StarIoError::Nak.code(), -5);
        assert_eq!(StarIoError::NoResponse.code(), -6);
        assert_eq!(StarIoError::Runtime("x".into()).code(), -7);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = StarIoError::NotOpen("/dev/ttyS0".into());
        assert_eq!(err.to_string(), "Port not open: /dev/ttyS0");
    }
}
