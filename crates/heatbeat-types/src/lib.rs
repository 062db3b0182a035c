//! Platform-agnostic types for HeatBeat thermostat synchronization.
//!
//! This crate provides the data model shared by the synchronization core
//! (heatbeat-core) and its front ends.
//!
//! # Features
//!
//! - Setpoint attribution ([`Origin`]) and operating mode ([`ThermostatMode`])
//! - Remote setpoint and telemetry records
//! - Setpoint range and step handling ([`SetpointBounds`])
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use heatbeat_types::{Origin, SetpointBounds};
//!
//! let bounds = SetpointBounds::default();
//! assert_eq!(bounds.clamp_quantize(21.2), Some(21.0));
//! assert_eq!(Origin::from_wire(Some("device")), Origin::Device);
//! ```

pub mod bounds;
pub mod error;
pub mod types;

pub use bounds::{
    DEFAULT_MAX, DEFAULT_MIN, DEFAULT_SETPOINT, DEFAULT_STEP, SETPOINT_EPSILON, SetpointBounds,
    setpoints_equal,
};
pub use error::{ParseError, ParseResult};
pub use types::{DeviceSummary, Origin, Reading, RemoteSetpoint, ThermostatMode};

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_origin_from_wire() {
        assert_eq!(Origin::from_wire(Some("app")), Origin::App);
        assert_eq!(Origin::from_wire(Some(" Device ")), Origin::Device);
        assert_eq!(Origin::from_wire(Some("")), Origin::Unknown);
        assert_eq!(Origin::from_wire(None), Origin::Unknown);
    }

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("heat".parse::<ThermostatMode>().unwrap(), ThermostatMode::Heat);
        assert_eq!("OFF".parse::<ThermostatMode>().unwrap(), ThermostatMode::Off);
        assert_eq!(ThermostatMode::Auto.to_string(), "auto");
        let err = "cool".parse::<ThermostatMode>().unwrap_err();
        assert_eq!(err, ParseError::UnknownMode("cool".to_string()));
    }

    #[test]
    fn test_reading_display() {
        let r = Reading::new(21.46, datetime!(2025-01-01 12:00 UTC))
            .with_humidity(45.0)
            .with_window_open(true);
        assert_eq!(r.to_string(), "21.5°C 45% (window open)");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_origin_serde_is_lenient() {
        let o: Origin = serde_json::from_str("\"device\"").unwrap();
        assert_eq!(o, Origin::Device);
        let o: Origin = serde_json::from_str("\"scheduler\"").unwrap();
        assert_eq!(o, Origin::Unknown);
        assert_eq!(serde_json::to_string(&Origin::App).unwrap(), "\"app\"");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_remote_setpoint_serde() {
        let sp = RemoteSetpoint::new(21.5, Origin::App, datetime!(2025-01-01 12:00 UTC))
            .with_mode(ThermostatMode::Heat);
        let json = serde_json::to_string(&sp).unwrap();
        assert!(json.contains("\"origin\":\"app\""));
        assert!(json.contains("\"mode\":\"heat\""));
        assert!(json.contains("2025-01-01T12:00:00Z"));
        let back: RemoteSetpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sp);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_reading_serde_skips_missing_fields() {
        let r = Reading::new(19.0, datetime!(2025-01-01 12:00 UTC));
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("humidity"));
        assert!(!json.contains("window_open"));
    }
}
