//! Setpoint range and quantization.
//!
//! Every setpoint the core stores or displays passes through
//! [`SetpointBounds::clamp_quantize`], so a value outside `[min, max]` or off
//! the step grid can never be observed.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Lowest setpoint accepted by default, in °C.
pub const DEFAULT_MIN: f64 = 5.0;
/// Highest setpoint accepted by default, in °C.
pub const DEFAULT_MAX: f64 = 30.0;
/// Default quantization step, in °C.
pub const DEFAULT_STEP: f64 = 0.5;
/// Setpoint assumed for a freshly registered thermostat.
pub const DEFAULT_SETPOINT: f64 = 21.0;

/// Tolerance for setpoint equality.
///
/// Must stay below half of the smallest step in use so two adjacent grid
/// values never compare equal.
pub const SETPOINT_EPSILON: f64 = 0.01;

/// Compare two setpoints within [`SETPOINT_EPSILON`].
///
/// # Examples
///
/// ```
/// use heatbeat_types::setpoints_equal;
///
/// assert!(setpoints_equal(21.0, 21.000_000_1));
/// assert!(!setpoints_equal(21.0, 21.5));
/// ```
#[must_use]
pub fn setpoints_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < SETPOINT_EPSILON
}

/// Inclusive setpoint range with a fixed step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SetpointBounds {
    /// Lowest accepted value.
    pub min: f64,
    /// Highest accepted value.
    pub max: f64,
    /// Quantization step.
    pub step: f64,
}

impl Default for SetpointBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            step: DEFAULT_STEP,
        }
    }
}

impl SetpointBounds {
    /// Create bounds, validating them.
    pub fn new(min: f64, max: f64, step: f64) -> ParseResult<Self> {
        let bounds = Self { min, max, step };
        bounds.validate()?;
        Ok(bounds)
    }

    /// Check that the range is non-empty, the step positive and both ends on the grid.
    pub fn validate(&self) -> ParseResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() || !self.step.is_finite() {
            return Err(ParseError::InvalidBounds(
                "min, max and step must be finite".to_string(),
            ));
        }
        if self.step <= 0.0 {
            return Err(ParseError::InvalidBounds(format!(
                "step must be > 0, got {}",
                self.step
            )));
        }
        if self.min >= self.max {
            return Err(ParseError::InvalidBounds(format!(
                "min ({}) must be below max ({})",
                self.min, self.max
            )));
        }
        if self.step < 2.0 * SETPOINT_EPSILON {
            return Err(ParseError::InvalidBounds(format!(
                "step must be at least {}",
                2.0 * SETPOINT_EPSILON
            )));
        }
        for (name, value) in [("min", self.min), ("max", self.max)] {
            let steps = value / self.step;
            if ((steps - steps.round()) * self.step).abs() >= SETPOINT_EPSILON {
                return Err(ParseError::InvalidBounds(format!(
                    "{name} ({value}) is not a multiple of step ({})",
                    self.step
                )));
            }
        }
        Ok(())
    }

    /// Clamp `value` into range and snap it to the nearest step.
    ///
    /// Returns `None` for NaN or infinite input.
    ///
    /// # Examples
    ///
    /// ```
    /// use heatbeat_types::SetpointBounds;
    ///
    /// let bounds = SetpointBounds::default();
    /// assert_eq!(bounds.clamp_quantize(21.3), Some(21.5));
    /// assert_eq!(bounds.clamp_quantize(40.0), Some(30.0));
    /// assert_eq!(bounds.clamp_quantize(f64::NAN), None);
    /// ```
    #[must_use]
    pub fn clamp_quantize(&self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            return None;
        }
        let clamped = value.clamp(self.min, self.max);
        let snapped = self.min + ((clamped - self.min) / self.step).round() * self.step;
        // Scrub representation noise left by non-binary steps such as 0.1.
        let scrubbed = (snapped * 1e6).round() / 1e6;
        Some(scrubbed.clamp(self.min, self.max))
    }

    /// Whether `value` lies within the range (inclusive, with tolerance).
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min - SETPOINT_EPSILON && value <= self.max + SETPOINT_EPSILON
    }

    /// Whether `value` sits on the step grid.
    #[must_use]
    pub fn is_on_step(&self, value: f64) -> bool {
        let steps = (value - self.min) / self.step;
        ((steps - steps.round()) * self.step).abs() < SETPOINT_EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds_are_valid() {
        assert!(SetpointBounds::default().validate().is_ok());
    }

    #[test]
    fn test_clamp_quantize_rounds_to_half_degrees() {
        let b = SetpointBounds::default();
        assert_eq!(b.clamp_quantize(20.24), Some(20.0));
        assert_eq!(b.clamp_quantize(20.26), Some(20.5));
        assert_eq!(b.clamp_quantize(20.75), Some(21.0));
    }

    #[test]
    fn test_clamp_quantize_clamps() {
        let b = SetpointBounds::default();
        assert_eq!(b.clamp_quantize(-100.0), Some(5.0));
        assert_eq!(b.clamp_quantize(30.4), Some(30.0));
        assert_eq!(b.clamp_quantize(f64::INFINITY), None);
    }

    #[test]
    fn test_clamp_quantize_tenth_step() {
        let b = SetpointBounds::new(10.0, 25.0, 0.1).unwrap();
        let v = b.clamp_quantize(21.349).unwrap();
        assert!(setpoints_equal(v, 21.3));
        assert!(b.is_on_step(v));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        assert!(SetpointBounds::new(30.0, 5.0, 0.5).is_err());
        assert!(SetpointBounds::new(5.0, 30.0, 0.0).is_err());
        assert!(SetpointBounds::new(5.0, 30.0, -0.5).is_err());
        assert!(SetpointBounds::new(5.2, 30.0, 0.5).is_err());
        assert!(SetpointBounds::new(f64::NAN, 30.0, 0.5).is_err());
    }

    #[test]
    fn test_contains_and_on_step() {
        let b = SetpointBounds::default();
        assert!(b.contains(5.0));
        assert!(b.contains(30.0));
        assert!(!b.contains(30.5));
        assert!(b.is_on_step(21.5));
        assert!(!b.is_on_step(21.25));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clamp_quantize_always_in_range_and_on_step(value in -1000.0f64..1000.0) {
                let b = SetpointBounds::default();
                let q = b.clamp_quantize(value).unwrap();
                prop_assert!(q >= b.min && q <= b.max);
                prop_assert!(b.is_on_step(q));
            }

            #[test]
            fn clamp_quantize_is_idempotent(value in -1000.0f64..1000.0) {
                let b = SetpointBounds::default();
                let once = b.clamp_quantize(value).unwrap();
                prop_assert_eq!(b.clamp_quantize(once), Some(once));
            }

            #[test]
            fn in_range_values_move_at_most_half_a_step(value in 5.0f64..30.0) {
                let b = SetpointBounds::default();
                let q = b.clamp_quantize(value).unwrap();
                prop_assert!((q - value).abs() <= b.step / 2.0 + 1e-9);
            }
        }
    }
}
