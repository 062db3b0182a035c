//! Error types for heatbeat-core.
//!
//! Transport failures (HTTP, WebSocket, JSON) are converted into this
//! taxonomy at the client boundary. The reconciler and scheduler only ever see
//! these variants.
//!
//! # Error Handling Strategies
//!
//! | Error | Kind | Handling |
//! |-------|------|----------|
//! | [`Error::RemoteUnavailable`] | transient | Keep last known value, retry on the next tick, alert after N in a row |
//! | [`Error::Malformed`] | transient | Same as `RemoteUnavailable` |
//! | [`Error::DeviceNotFound`] | transient on fetch, rejection on write | Device may be re-registering |
//! | [`Error::Unauthorized`] | fatal | Stop the scheduler and end the session |
//! | [`Error::Rejected`] | rejection | Roll back the edit and show a notice |
//! | [`Error::InvalidConfig`] | fatal | Fix configuration and restart |
//!
//! No error is retried immediately. The next scheduled reconciliation tick is
//! the retry, which keeps a flapping backend from receiving a write storm.

use thiserror::Error;

/// Errors that can occur while synchronizing with the remote.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Network or server failure.
    #[error("Remote unavailable: {reason}")]
    RemoteUnavailable {
        /// What went wrong.
        reason: String,
    },

    /// Credentials were refused or have expired.
    #[error("Unauthorized: session expired or credentials rejected")]
    Unauthorized,

    /// The remote refused the requested value.
    #[error("Rejected by remote: {reason}")]
    Rejected {
        /// Reason reported by the remote.
        reason: String,
    },

    /// The remote answered with something we could not parse.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The remote does not know this device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The client does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification used by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recovered by the next scheduled tick.
    Transient,
    /// The remote refused a value; roll back.
    Rejected,
    /// Ends the session.
    Fatal,
}

impl Error {
    /// Create a remote-unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a rejection error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a malformed-response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RemoteUnavailable { .. } | Self::Malformed(_) | Self::DeviceNotFound(_) => {
                ErrorKind::Transient
            }
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::Unauthorized | Self::InvalidConfig(_) | Self::Unsupported(_) => ErrorKind::Fatal,
            Self::Cancelled => ErrorKind::Transient,
        }
    }

    /// Whether the next scheduled tick may succeed where this one failed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether this error ends the session.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<heatbeat_types::ParseError> for Error {
    fn from(err: heatbeat_types::ParseError) -> Self {
        match err {
            heatbeat_types::ParseError::InvalidBounds(msg) => Error::InvalidConfig(msg),
            other => Error::Malformed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}

/// Result type alias using heatbeat-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unavailable("connection refused");
        assert_eq!(err.to_string(), "Remote unavailable: connection refused");

        let err = Error::rejected("mode must be auto|heat|off");
        assert!(err.to_string().contains("auto|heat|off"));

        let err = Error::DeviceNotFound("t-1".to_string());
        assert!(err.to_string().contains("t-1"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::unavailable("x").kind(), ErrorKind::Transient);
        assert_eq!(Error::malformed("x").kind(), ErrorKind::Transient);
        assert_eq!(Error::rejected("x").kind(), ErrorKind::Rejected);
        assert_eq!(Error::Unauthorized.kind(), ErrorKind::Fatal);
        assert!(Error::Unauthorized.is_session_fatal());
        assert!(!Error::rejected("x").is_session_fatal());
        assert!(Error::DeviceNotFound("x".into()).is_transient());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = heatbeat_types::ParseError::UnknownMode("cool".into()).into();
        assert!(matches!(err, Error::Malformed(_)));

        let err: Error = heatbeat_types::ParseError::InvalidBounds("bad".into()).into();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<f64>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
