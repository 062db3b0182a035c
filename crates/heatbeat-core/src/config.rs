//! Synchronization configuration.
//!
//! [`SyncConfig`] is plain serde data so front ends can embed it in their own
//! configuration files (the CLI stores it as the `[sync]` table).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use heatbeat_types::SetpointBounds;

use crate::error::{Error, Result};
use crate::reconciler::DEFAULT_UNAVAILABLE_ALERT_AFTER;
use crate::scheduler::DeliveryMode;

/// Minimum non-zero polling interval in seconds.
pub const MIN_POLL_INTERVAL_SECS: u64 = 3;
/// Maximum polling interval in seconds.
pub const MAX_POLL_INTERVAL_SECS: u64 = 30;
/// Minimum push keepalive period in seconds.
pub const MIN_KEEPALIVE_SECS: u64 = 5;
/// Maximum push keepalive period in seconds.
pub const MAX_KEEPALIVE_SECS: u64 = 300;
/// Maximum telemetry readings kept per device.
pub const MAX_TELEMETRY_HISTORY: usize = 500;

/// How remote changes reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Fetch every device on a fixed interval.
    #[default]
    Polling,
    /// Hold an event-stream connection per device.
    Push,
}

/// Configuration for the synchronization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Setpoint range and step.
    pub bounds: SetpointBounds,
    /// Delivery model.
    pub delivery: Delivery,
    /// Polling interval in seconds; 0 disables polling.
    pub poll_interval_secs: u64,
    /// Push keepalive period in seconds.
    pub keepalive_secs: u64,
    /// Readings kept per device.
    pub telemetry_history: usize,
    /// Capacity of the change-notification channel.
    pub event_capacity: usize,
    /// Consecutive transient failures before a connection notice.
    pub unavailable_alert_after: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bounds: SetpointBounds::default(),
            delivery: Delivery::Polling,
            poll_interval_secs: 5,
            keepalive_secs: 30,
            telemetry_history: 1,
            event_capacity: 100,
            unavailable_alert_after: DEFAULT_UNAVAILABLE_ALERT_AFTER,
        }
    }
}

impl SyncConfig {
    /// Set the polling interval (seconds; 0 disables).
    #[must_use]
    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Switch to push delivery with the given keepalive.
    #[must_use]
    pub fn push(mut self, keepalive_secs: u64) -> Self {
        self.delivery = Delivery::Push;
        self.keepalive_secs = keepalive_secs;
        self
    }

    /// Set the number of readings kept per device.
    #[must_use]
    pub fn telemetry_history(mut self, readings: usize) -> Self {
        self.telemetry_history = readings;
        self
    }

    /// Set the setpoint bounds.
    #[must_use]
    pub fn bounds(mut self, bounds: SetpointBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Set the failure count that raises a connection notice.
    #[must_use]
    pub fn unavailable_alert_after(mut self, failures: u32) -> Self {
        self.unavailable_alert_after = failures;
        self
    }

    /// Scheduler mode described by this configuration.
    pub fn delivery_mode(&self) -> DeliveryMode {
        match self.delivery {
            Delivery::Polling if self.poll_interval_secs == 0 => DeliveryMode::Disabled,
            Delivery::Polling => DeliveryMode::Polling {
                interval: Duration::from_secs(self.poll_interval_secs),
            },
            Delivery::Push => DeliveryMode::Push {
                keepalive: Duration::from_secs(self.keepalive_secs),
            },
        }
    }

    /// Collect every problem with this configuration.
    ///
    /// Field paths are relative to the `sync` table.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = self.bounds.validate() {
            errors.push(ValidationError::new("sync.bounds", e.to_string()));
        }

        if self.poll_interval_secs != 0
            && !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&self.poll_interval_secs)
        {
            errors.push(ValidationError::new(
                "sync.poll_interval_secs",
                format!(
                    "poll interval {} must be 0 (disabled) or between {} and {} seconds",
                    self.poll_interval_secs, MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS
                ),
            ));
        }

        if !(MIN_KEEPALIVE_SECS..=MAX_KEEPALIVE_SECS).contains(&self.keepalive_secs) {
            errors.push(ValidationError::new(
                "sync.keepalive_secs",
                format!(
                    "keepalive {} must be between {} and {} seconds",
                    self.keepalive_secs, MIN_KEEPALIVE_SECS, MAX_KEEPALIVE_SECS
                ),
            ));
        }

        if self.telemetry_history == 0 || self.telemetry_history > MAX_TELEMETRY_HISTORY {
            errors.push(ValidationError::new(
                "sync.telemetry_history",
                format!(
                    "telemetry history {} must be between 1 and {}",
                    self.telemetry_history, MAX_TELEMETRY_HISTORY
                ),
            ));
        }

        if self.event_capacity == 0 {
            errors.push(ValidationError::new(
                "sync.event_capacity",
                "event capacity must be > 0",
            ));
        }

        if self.unavailable_alert_after == 0 {
            errors.push(ValidationError::new(
                "sync.unavailable_alert_after",
                "alert threshold must be > 0",
            ));
        }

        errors
    }

    /// Validate and convert problems into [`Error::InvalidConfig`].
    pub fn check(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format_validation_errors(&errors)))
        }
    }
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `sync.poll_interval_secs`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Render validation errors one per line.
pub fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
