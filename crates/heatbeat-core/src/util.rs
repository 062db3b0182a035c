//! Utility functions for heatbeat-core.
//!
//! This module contains shared helpers used by the remote clients.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::{Error, Result};

/// Parse a backend timestamp.
///
/// Accepts RFC 3339 (`2025-01-01T12:00:00Z`, `...+02:00`) and naive ISO 8601
/// without an offset (`2025-01-01T12:00:00.123456`), which is taken as UTC.
/// A space is accepted in place of the `T` separator.
///
/// # Example
///
/// ```
/// use heatbeat_core::util::parse_timestamp;
///
/// let ts = parse_timestamp("2025-01-01T12:00:00.5").unwrap();
/// assert_eq!(ts.unix_timestamp(), 1735732800);
/// ```
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let normalized = raw.trim().replacen(' ', "T", 1);
    if let Ok(ts) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(ts);
    }
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(&normalized, naive)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Parse a timestamp, falling back to the current time.
pub fn parse_timestamp_or_now(raw: Option<&str>) -> OffsetDateTime {
    raw.and_then(parse_timestamp)
        .unwrap_or_else(OffsetDateTime::now_utc)
}

/// Normalize a base URL: trim whitespace and trailing slashes, require http(s).
pub fn normalize_base_url(base_url: &str) -> Result<String> {
    let base_url = base_url.trim().trim_end_matches('/').to_string();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::invalid_config(format!(
            "URL must start with http:// or https://, got: {}",
            base_url
        )));
    }
    Ok(base_url)
}

/// Derive the WebSocket base from an HTTP base URL.
pub fn websocket_base(http_base: &str) -> String {
    if let Some(rest) = http_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_base.to_string()
    }
}
