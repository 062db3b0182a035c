//! Error types for data parsing in heatbeat-types.

use thiserror::Error;

/// Errors that can occur when parsing thermostat data.
///
/// This error type is transport-agnostic and does not include network
/// errors (those belong in heatbeat-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A thermostat mode string was not one of `auto`, `heat` or `off`.
    #[error("Unknown thermostat mode: {0:?}")]
    UnknownMode(String),

    /// A timestamp could not be parsed.
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// Setpoint bounds are inconsistent.
    #[error("Invalid setpoint bounds: {0}")]
    InvalidBounds(String),
}

/// Result type alias using heatbeat-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
