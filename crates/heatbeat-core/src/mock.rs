//! Mock remote implementation for testing.
//!
//! This module provides an in-memory thermostat backend that can be used for
//! unit testing and demos without a running server.
//!
//! The [`MockRemote`] implements the [`RemoteStateClient`] trait, allowing it
//! to be used interchangeably with the HTTP client in generic code.
//!
//! # Features
//!
//! - **Out-of-band changes**: Simulate a user turning the dial on the device
//!   or another app session changing the setpoint
//! - **Failure injection**: Transient fetch failures, rejected or failed writes,
//!   expired credentials
//! - **Latency simulation**: Delay fetches and writes to exercise interleavings
//! - **Push events**: Subscriptions receive setpoint and telemetry changes

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use heatbeat_types::{
    DEFAULT_SETPOINT, DeviceSummary, Origin, Reading, RemoteSetpoint, ThermostatMode,
};

use crate::error::{Error, Result};
use crate::push::{PushEvent, Subscription};
use crate::traits::RemoteStateClient;

#[derive(Debug, Clone)]
struct MockThermostat {
    name: Option<String>,
    setpoint: f64,
    origin: Origin,
    mode: ThermostatMode,
    updated_at: OffsetDateTime,
    /// Oldest first.
    readings: Vec<Reading>,
}

impl MockThermostat {
    fn new(setpoint: f64, origin: Origin) -> Self {
        Self {
            name: None,
            setpoint,
            origin,
            mode: ThermostatMode::Auto,
            updated_at: OffsetDateTime::now_utc(),
            readings: Vec::new(),
        }
    }

    fn snapshot(&self) -> RemoteSetpoint {
        RemoteSetpoint::new(self.setpoint, self.origin, self.updated_at).with_mode(self.mode)
    }
}

/// An in-memory thermostat backend.
///
/// # Example
///
/// ```
/// use heatbeat_core::{MockRemoteBuilder, RemoteStateClient};
/// use heatbeat_types::Origin;
///
/// #[tokio::main]
/// async fn main() {
///     let remote = MockRemoteBuilder::new().device("living-room", 20.0).build();
///     remote.set_device_setpoint("living-room", 19.5).await;
///
///     let state = remote.fetch_state("living-room").await.unwrap();
///     assert_eq!(state.setpoint, 19.5);
///     assert_eq!(state.origin, Origin::Device);
/// }
/// ```
pub struct MockRemote {
    devices: RwLock<HashMap<String, MockThermostat>>,
    push: broadcast::Sender<PushEvent>,
    push_enabled: AtomicBool,
    unauthorized: AtomicBool,
    next_write_error: RwLock<Option<Error>>,
    remaining_fetch_failures: AtomicU32,
    fetch_count: AtomicU32,
    write_count: AtomicU32,
    writes_in_flight: AtomicU32,
    max_concurrent_writes: AtomicU32,
    /// Simulated fetch latency in milliseconds (0 = no delay).
    fetch_latency_ms: AtomicU64,
    /// Simulated write latency in milliseconds (0 = no delay).
    write_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("fetch_count", &self.fetch_count.load(Ordering::Relaxed))
            .field("write_count", &self.write_count.load(Ordering::Relaxed))
            .field("push_enabled", &self.push_enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Create an empty mock backend.
    pub fn new() -> Self {
        Self::from_devices(HashMap::new(), true)
    }

    fn from_devices(devices: HashMap<String, MockThermostat>, push_enabled: bool) -> Self {
        let (push, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(devices),
            push,
            push_enabled: AtomicBool::new(push_enabled),
            unauthorized: AtomicBool::new(false),
            next_write_error: RwLock::new(None),
            remaining_fetch_failures: AtomicU32::new(0),
            fetch_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            writes_in_flight: AtomicU32::new(0),
            max_concurrent_writes: AtomicU32::new(0),
            fetch_latency_ms: AtomicU64::new(0),
            write_latency_ms: AtomicU64::new(0),
        }
    }

    // --- Backend state ---

    /// Register a thermostat at the default setpoint.
    pub async fn add_device(&self, device_id: &str) {
        self.devices
            .write()
            .await
            .entry(device_id.to_string())
            .or_insert_with(|| MockThermostat::new(DEFAULT_SETPOINT, Origin::App));
    }

    /// Deregister a thermostat.
    pub async fn remove_device(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    /// Simulate someone turning the dial on the thermostat.
    pub async fn set_device_setpoint(&self, device_id: &str, setpoint: f64) {
        self.change_setpoint(device_id, setpoint, Origin::Device).await;
    }

    /// Simulate another application session writing a setpoint.
    pub async fn set_app_setpoint(&self, device_id: &str, setpoint: f64) {
        self.change_setpoint(device_id, setpoint, Origin::App).await;
    }

    async fn change_setpoint(&self, device_id: &str, setpoint: f64, origin: Origin) {
        let snapshot = {
            let mut devices = self.devices.write().await;
            let device = devices
                .entry(device_id.to_string())
                .or_insert_with(|| MockThermostat::new(setpoint, origin));
            device.setpoint = setpoint;
            device.origin = origin;
            device.updated_at = OffsetDateTime::now_utc();
            device.snapshot()
        };
        self.emit(PushEvent::SetpointChanged {
            device_id: device_id.to_string(),
            setpoint: snapshot,
        });
    }

    /// Set the operating mode reported for a thermostat.
    pub async fn set_mode(&self, device_id: &str, mode: ThermostatMode) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.mode = mode;
        }
    }

    /// Store a reading and push it to subscribers.
    pub async fn push_reading(&self, device_id: &str, reading: Reading) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.readings.push(reading);
        }
        self.emit(PushEvent::Telemetry {
            device_id: device_id.to_string(),
            reading,
        });
    }

    /// Tell subscribers of a device that their connection dropped.
    pub fn drop_push_connection(&self, device_id: &str) {
        self.emit(PushEvent::Disconnected {
            device_id: device_id.to_string(),
            reason: "mock connection reset".to_string(),
        });
    }

    fn emit(&self, event: PushEvent) {
        let _ = self.push.send(event);
    }

    /// Current backend value, bypassing counters and failure injection.
    pub async fn current(&self, device_id: &str) -> Option<RemoteSetpoint> {
        self.devices.read().await.get(device_id).map(MockThermostat::snapshot)
    }

    // --- Failure injection ---

    /// Fail the next write with `error`.
    pub async fn fail_next_write(&self, error: Error) {
        *self.next_write_error.write().await = Some(error);
    }

    /// Fail the next `count` fetches with [`Error::RemoteUnavailable`].
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_fetch_failures.store(count, Ordering::Relaxed);
    }

    /// Reject every call with [`Error::Unauthorized`] while set.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::Relaxed);
    }

    /// Enable or disable push subscriptions.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.push_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Set simulated fetch latency.
    ///
    /// The fetched value is captured before the delay, like a response that
    /// is slow to arrive.
    pub fn set_fetch_latency(&self, latency: Duration) {
        self.fetch_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated write latency.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Counters ---

    /// Number of `fetch_state` calls that reached the backend.
    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    /// Number of `write_setpoint` calls that reached the backend.
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Highest number of writes ever outstanding at once.
    pub fn max_concurrent_writes(&self) -> u32 {
        self.max_concurrent_writes.load(Ordering::Relaxed)
    }

    /// Reset fetch and write counters.
    pub fn reset_counts(&self) {
        self.fetch_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
        self.max_concurrent_writes.store(0, Ordering::Relaxed);
    }

    fn check_authorized(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            Err(Error::Unauthorized)
        } else {
            Ok(())
        }
    }

    fn take_fetch_failure(&self) -> Result<()> {
        let remaining = self.remaining_fetch_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.remaining_fetch_failures
                .store(remaining - 1, Ordering::Relaxed);
            return Err(Error::unavailable("mock transient failure"));
        }
        Ok(())
    }

    async fn sleep_ms(ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RemoteStateClient for MockRemote {
    async fn fetch_state(&self, device_id: &str) -> Result<RemoteSetpoint> {
        self.check_authorized()?;
        self.take_fetch_failure()?;
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        let snapshot = self
            .current(device_id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        Self::sleep_ms(self.fetch_latency_ms.load(Ordering::Relaxed)).await;
        Ok(snapshot)
    }

    async fn write_setpoint(&self, device_id: &str, value: f64) -> Result<RemoteSetpoint> {
        self.check_authorized()?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        let now_in_flight = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_writes
            .fetch_max(now_in_flight, Ordering::SeqCst);

        Self::sleep_ms(self.write_latency_ms.load(Ordering::Relaxed)).await;

        let result = match self.next_write_error.write().await.take() {
            Some(error) => Err(error),
            None => {
                let mut devices = self.devices.write().await;
                match devices.get_mut(device_id) {
                    Some(device) => {
                        device.setpoint = value;
                        device.origin = Origin::App;
                        device.updated_at = OffsetDateTime::now_utc();
                        Ok(device.snapshot())
                    }
                    None => Err(Error::DeviceNotFound(device_id.to_string())),
                }
            }
        };
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Ok(snapshot) = &result {
            self.emit(PushEvent::SetpointChanged {
                device_id: device_id.to_string(),
                setpoint: *snapshot,
            });
        }
        result
    }

    async fn fetch_latest_reading(&self, device_id: &str) -> Result<Option<Reading>> {
        self.check_authorized()?;
        let devices = self.devices.read().await;
        let device = devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        Ok(device.readings.last().copied())
    }

    async fn fetch_readings(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        self.check_authorized()?;
        let devices = self.devices.read().await;
        let device = devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        Ok(device.readings.iter().rev().take(limit).copied().collect())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        self.check_authorized()?;
        let devices = self.devices.read().await;
        let mut list: Vec<DeviceSummary> = devices
            .iter()
            .map(|(id, d)| DeviceSummary {
                id: id.clone(),
                name: d.name.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        sink: mpsc::Sender<PushEvent>,
    ) -> Result<Subscription> {
        self.check_authorized()?;
        if !self.push_enabled.load(Ordering::Relaxed) {
            return Err(Error::Unsupported("push subscriptions"));
        }

        let mut events = self.push.subscribe();
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let task_device = device_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.device_id() == task_device => {
                            let disconnected = matches!(event, PushEvent::Disconnected { .. });
                            if sink.send(event).await.is_err() || disconnected {
                                break;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Subscription::new(device_id, cancel_token, handle))
    }
}

/// Builder for creating mock remotes with custom settings.
#[derive(Debug, Default)]
pub struct MockRemoteBuilder {
    devices: HashMap<String, MockThermostat>,
    push_disabled: bool,
}

impl MockRemoteBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a thermostat whose setpoint was last set by the app.
    #[must_use]
    pub fn device(mut self, device_id: &str, setpoint: f64) -> Self {
        self.devices.insert(
            device_id.to_string(),
            MockThermostat::new(setpoint, Origin::App),
        );
        self
    }

    /// Add a thermostat with an explicit origin.
    #[must_use]
    pub fn device_with_origin(mut self, device_id: &str, setpoint: f64, origin: Origin) -> Self {
        self.devices
            .insert(device_id.to_string(), MockThermostat::new(setpoint, origin));
        self
    }

    /// Give a thermostat a display name.
    #[must_use]
    pub fn name(mut self, device_id: &str, name: &str) -> Self {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.name = Some(name.to_string());
        }
        self
    }

    /// Set a thermostat's operating mode.
    #[must_use]
    pub fn mode(mut self, device_id: &str, mode: ThermostatMode) -> Self {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.mode = mode;
        }
        self
    }

    /// Add a stored reading.
    #[must_use]
    pub fn reading(mut self, device_id: &str, reading: Reading) -> Self {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.readings.push(reading);
        }
        self
    }

    /// Make `subscribe` report push as unsupported.
    #[must_use]
    pub fn without_push(mut self) -> Self {
        self.push_disabled = true;
        self
    }

    /// Build the mock remote.
    #[must_use]
    pub fn build(self) -> MockRemote {
        MockRemote::from_devices(self.devices, !self.push_disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_fetch_and_write() {
        let remote = MockRemoteBuilder::new().device("t-1", 20.0).build();
        let state = remote.fetch_state("t-1").await.unwrap();
        assert_eq!(state.setpoint, 20.0);
        assert_eq!(state.mode, Some(ThermostatMode::Auto));

        let written = remote.write_setpoint("t-1", 22.5).await.unwrap();
        assert_eq!(written.setpoint, 22.5);
        assert_eq!(written.origin, Origin::App);
        assert_eq!(remote.write_count(), 1);
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let remote = MockRemote::new();
        assert!(matches!(
            remote.fetch_state("missing").await,
            Err(Error::DeviceNotFound(_))
        ));
        assert!(matches!(
            remote.write_setpoint("missing", 20.0).await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_device_side_change() {
        let remote = MockRemoteBuilder::new().device("t-1", 20.0).build();
        remote.set_device_setpoint("t-1", 18.5).await;
        let state = remote.fetch_state("t-1").await.unwrap();
        assert_eq!(state.setpoint, 18.5);
        assert_eq!(state.origin, Origin::Device);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MockRemoteBuilder::new().device("t-1", 20.0).build();

        remote.set_transient_failures(2);
        assert!(remote.fetch_state("t-1").await.is_err());
        assert!(remote.fetch_state("t-1").await.is_err());
        assert!(remote.fetch_state("t-1").await.is_ok());

        remote.fail_next_write(Error::rejected("too hot")).await;
        assert!(matches!(
            remote.write_setpoint("t-1", 29.0).await,
            Err(Error::Rejected { .. })
        ));
        assert_eq!(remote.current("t-1").await.unwrap().setpoint, 20.0);
        assert!(remote.write_setpoint("t-1", 21.0).await.is_ok());

        remote.set_unauthorized(true);
        assert_eq!(remote.fetch_state("t-1").await, Err(Error::Unauthorized));
    }

    #[tokio::test]
    async fn test_readings_newest_first() {
        let base = datetime!(2025-01-01 12:00 UTC);
        let remote = MockRemoteBuilder::new()
            .device("t-1", 20.0)
            .reading("t-1", Reading::new(19.0, base))
            .reading("t-1", Reading::new(19.5, base + time::Duration::minutes(1)))
            .build();
        let latest = remote.fetch_latest_reading("t-1").await.unwrap().unwrap();
        assert_eq!(latest.temperature, 19.5);
        let all = remote.fetch_readings("t-1", 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].temperature, 19.5);
    }

    #[tokio::test]
    async fn test_list_devices_sorted() {
        let remote = MockRemoteBuilder::new()
            .device("b", 20.0)
            .device("a", 20.0)
            .name("a", "Kitchen")
            .build();
        let list = remote.list_devices().await.unwrap();
        assert_eq!(list[0], DeviceSummary::with_name("a", "Kitchen"));
        assert_eq!(list[1].id, "b");
    }

    #[tokio::test]
    async fn test_subscription_filters_by_device() {
        let remote = MockRemoteBuilder::new()
            .device("t-1", 20.0)
            .device("t-2", 20.0)
            .build();
        let (tx, mut rx) = mpsc::channel(8);
        let sub = remote.subscribe("t-1", tx).await.unwrap();
        assert!(sub.is_active());

        remote.set_device_setpoint("t-2", 25.0).await;
        remote.set_device_setpoint("t-1", 19.0).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), "t-1");
        assert!(matches!(
            event,
            PushEvent::SetpointChanged { setpoint, .. } if setpoint.setpoint == 19.0
        ));
    }

    #[tokio::test]
    async fn test_push_disabled() {
        let remote = MockRemoteBuilder::new().device("t-1", 20.0).without_push().build();
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            remote.subscribe("t-1", tx).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_write_tracking() {
        let remote = std::sync::Arc::new(MockRemoteBuilder::new().device("t-1", 20.0).build());
        remote.set_write_latency(Duration::from_millis(100));
        let a = {
            let r = remote.clone();
            tokio::spawn(async move { r.write_setpoint("t-1", 21.0).await })
        };
        let b = {
            let r = remote.clone();
            tokio::spawn(async move { r.write_setpoint("t-1", 22.0).await })
        };
        let _ = a.await;
        let _ = b.await;
        assert_eq!(remote.max_concurrent_writes(), 2);
    }
}
