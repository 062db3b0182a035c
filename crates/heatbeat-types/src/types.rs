//! Core types for thermostat state and telemetry.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// Which actor produced the currently accepted setpoint.
///
/// Parsing is lenient: anything other than `app` or `device` becomes
/// [`Origin::Unknown`], so a backend that adds a new source never breaks
/// reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase", from = "String"))]
pub enum Origin {
    /// Set through an application session.
    App,
    /// Set on the physical thermostat.
    Device,
    /// Source not reported or not recognized.
    #[default]
    Unknown,
}

impl Origin {
    /// Parse the wire representation, tolerating missing or unknown values.
    ///
    /// # Examples
    ///
    /// ```
    /// use heatbeat_types::Origin;
    ///
    /// assert_eq!(Origin::from_wire(Some("device")), Origin::Device);
    /// assert_eq!(Origin::from_wire(Some("APP")), Origin::App);
    /// assert_eq!(Origin::from_wire(Some("schedule")), Origin::Unknown);
    /// assert_eq!(Origin::from_wire(None), Origin::Unknown);
    /// ```
    #[must_use]
    pub fn from_wire(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("app") => Origin::App,
            Some(s) if s.eq_ignore_ascii_case("device") => Origin::Device,
            _ => Origin::Unknown,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::App => "app",
            Origin::Device => "device",
            Origin::Unknown => "unknown",
        }
    }
}

impl From<String> for Origin {
    fn from(value: String) -> Self {
        Origin::from_wire(Some(&value))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thermostat operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ThermostatMode {
    /// Follow the schedule.
    #[default]
    Auto,
    /// Heat to the setpoint.
    Heat,
    /// Heating disabled.
    Off,
}

impl ThermostatMode {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermostatMode::Auto => "auto",
            ThermostatMode::Heat => "heat",
            ThermostatMode::Off => "off",
        }
    }
}

impl FromStr for ThermostatMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ThermostatMode::Auto),
            "heat" => Ok(ThermostatMode::Heat),
            "off" => Ok(ThermostatMode::Off),
            _ => Err(ParseError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A setpoint as reported or acknowledged by the remote.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteSetpoint {
    /// Target temperature in °C.
    pub setpoint: f64,
    /// Who produced this value.
    pub origin: Origin,
    /// When the remote last confirmed this value.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub confirmed_at: OffsetDateTime,
    /// Operating mode, when the remote reports one.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub mode: Option<ThermostatMode>,
}

impl RemoteSetpoint {
    /// Create a remote setpoint without a mode.
    pub fn new(setpoint: f64, origin: Origin, confirmed_at: OffsetDateTime) -> Self {
        Self {
            setpoint,
            origin,
            confirmed_at,
            mode: None,
        }
    }

    /// Attach the operating mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ThermostatMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Immutable telemetry sample from a thermostat's sensors.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Measured temperature in °C.
    pub temperature: f32,
    /// Relative humidity in percent.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub humidity: Option<f32>,
    /// Atmospheric pressure in hPa.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub pressure: Option<f32>,
    /// Whether the device detected an open window.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub window_open: Option<bool>,
    /// When the sample was taken.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub observed_at: OffsetDateTime,
}

impl Reading {
    /// Create a reading carrying only a temperature.
    pub fn new(temperature: f32, observed_at: OffsetDateTime) -> Self {
        Self {
            temperature,
            humidity: None,
            pressure: None,
            window_open: None,
            observed_at,
        }
    }

    /// Set relative humidity.
    #[must_use]
    pub fn with_humidity(mut self, humidity: f32) -> Self {
        self.humidity = Some(humidity);
        self
    }

    /// Set pressure.
    #[must_use]
    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = Some(pressure);
        self
    }

    /// Set the open-window flag.
    #[must_use]
    pub fn with_window_open(mut self, open: bool) -> Self {
        self.window_open = Some(open);
        self
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C", self.temperature)?;
        if let Some(h) = self.humidity {
            write!(f, " {h:.0}%")?;
        }
        if let Some(p) = self.pressure {
            write!(f, " {p:.1}hPa")?;
        }
        if self.window_open == Some(true) {
            write!(f, " (window open)")?;
        }
        Ok(())
    }
}

/// A thermostat known to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSummary {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
}

impl DeviceSummary {
    /// Create a summary without a name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a summary with a name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}
