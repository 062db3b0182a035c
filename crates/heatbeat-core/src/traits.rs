//! Trait abstraction for the remote side of synchronization.
//!
//! This module provides the [`RemoteStateClient`] trait that abstracts over
//! the HTTP backend and the in-memory mock used in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use heatbeat_types::{DeviceSummary, Reading, RemoteSetpoint};

use crate::error::{Error, Result};
use crate::push::{PushEvent, Subscription};

/// Fetches and writes thermostat state. No business logic lives here.
///
/// Implementations must convert transport failures into [`Error`] before
/// returning; callers never see HTTP status codes or socket errors.
///
/// # Example
///
/// ```ignore
/// use heatbeat_core::{RemoteStateClient, Result};
///
/// async fn show<C: RemoteStateClient>(client: &C, id: &str) -> Result<()> {
///     let state = client.fetch_state(id).await?;
///     println!("{id}: {} ({})", state.setpoint, state.origin);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait RemoteStateClient: Send + Sync {
    /// Fetch the authoritative setpoint for a device.
    async fn fetch_state(&self, device_id: &str) -> Result<RemoteSetpoint>;

    /// Write a new setpoint and return the value the remote stored.
    ///
    /// The echoed value is authoritative and may differ from `value`.
    async fn write_setpoint(&self, device_id: &str, value: f64) -> Result<RemoteSetpoint>;

    /// Fetch the newest telemetry sample, if any exists.
    async fn fetch_latest_reading(&self, device_id: &str) -> Result<Option<Reading>>;

    /// Fetch up to `limit` samples, newest first.
    ///
    /// The default implementation returns at most the latest reading.
    async fn fetch_readings(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.fetch_latest_reading(device_id).await?.into_iter().collect())
    }

    /// List devices visible to the current session.
    ///
    /// The default implementation returns an empty list.
    async fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        Ok(Vec::new())
    }

    /// Open a push subscription delivering events into `sink`.
    ///
    /// Dropping the returned [`Subscription`] closes it. The default
    /// implementation reports that push delivery is not available.
    async fn subscribe(
        &self,
        device_id: &str,
        sink: mpsc::Sender<PushEvent>,
    ) -> Result<Subscription> {
        let _ = (device_id, sink);
        Err(Error::Unsupported("push subscriptions"))
    }
}
