//! Synchronization engine.
//!
//! [`SyncEngine`] is the entry point for presentation adapters. It wires the
//! [`Reconciler`], the [`CommandDispatcher`], the telemetry cache and the
//! scheduler around one [`RemoteStateClient`], and publishes a [`SyncEvent`]
//! for every visible change.
//!
//! User intents ([`SyncEngine::request_delta`], [`SyncEngine::request_absolute`])
//! are synchronous and never block on the network: they update the displayed
//! value at once and wake the scheduler, which sends the edit upstream.
//!
//! ```
//! use std::sync::Arc;
//! use heatbeat_core::{MockRemoteBuilder, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> heatbeat_core::Result<()> {
//!     let remote = Arc::new(MockRemoteBuilder::new().device("hall", 20.0).build());
//!     let engine = SyncEngine::new(remote, SyncConfig::default())?;
//!
//!     engine.watch("hall");
//!     engine.sync_device("hall").await?;
//!     assert_eq!(engine.request_delta("hall", 0.5), Some(20.5));
//!
//!     // Re-reads the remote, sees no drift and writes the edit.
//!     engine.sync_device("hall").await?;
//!     assert_eq!(engine.display_state("hall").unwrap().setpoint, 20.5);
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use heatbeat_types::{DeviceSummary, Origin, Reading, RemoteSetpoint, setpoints_equal};

use crate::config::SyncConfig;
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, SyncEvent};
use crate::push::PushEvent;
use crate::reconciler::{
    DeviceState, DisplayState, FailureOutcome, ReconcileOutcome, Reconciler, SharedReconciler,
    lock,
};
use crate::scheduler::{self, DeliveryMode, SchedulerHandle};
use crate::telemetry::TelemetryCache;
use crate::traits::RemoteStateClient;

/// State shared between the engine and its scheduler task.
pub(crate) struct EngineCore {
    pub(crate) client: Arc<dyn RemoteStateClient>,
    /// Signalled when a user edit is waiting to be sent.
    pub(crate) wake: Notify,
    telemetry_history: usize,
    reconciler: SharedReconciler,
    telemetry: Mutex<TelemetryCache>,
    dispatcher: CommandDispatcher,
    events: EventDispatcher,
    /// Token of the running scheduler, cancelled on session expiry.
    scheduler_token: Mutex<Option<CancellationToken>>,
    expired: AtomicBool,
}

impl EngineCore {
    fn telemetry(&self) -> MutexGuard<'_, TelemetryCache> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn device_ids(&self) -> Vec<String> {
        lock(&self.reconciler).device_ids()
    }

    /// Devices with an edit waiting and no write outstanding.
    pub(crate) fn pending_device_ids(&self) -> Vec<String> {
        let reconciler = lock(&self.reconciler);
        reconciler
            .device_ids()
            .into_iter()
            .filter(|id| reconciler.has_pending_edit(id))
            .collect()
    }

    fn publish_display(&self, device_id: &str) {
        let display = lock(&self.reconciler).display_state(device_id);
        if let Some(display) = display {
            self.events.send(SyncEvent::StateChanged { display });
        }
    }

    /// Fetch state and telemetry for one device and reconcile.
    ///
    /// A pending edit that survives reconciliation is written before this
    /// returns.
    pub(crate) async fn sync_device(&self, device_id: &str) -> Result<ReconcileOutcome> {
        let ticket = lock(&self.reconciler)
            .issue_ticket(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        let (state, readings) = tokio::join!(
            self.client.fetch_state(device_id),
            self.fetch_telemetry(device_id)
        );

        let remote = match state {
            Ok(remote) => remote,
            Err(e) => {
                self.handle_failure(device_id, &e);
                return Err(e);
            }
        };

        let outcome = lock(&self.reconciler).reconcile(&ticket, remote);
        debug!(device_id, seq = ticket.seq, ?outcome, "Reconciled remote state");
        if outcome.is_visible_change() {
            self.publish_display(device_id);
        }

        match readings {
            Ok(readings) => self.cache_readings(device_id, readings),
            Err(e) => debug!(device_id, "Telemetry fetch failed: {e}"),
        }

        if matches!(outcome, ReconcileOutcome::Dispatch { .. })
            && self.dispatch(device_id).await == DispatchOutcome::SessionExpired
        {
            return Err(Error::Unauthorized);
        }
        Ok(outcome)
    }

    async fn fetch_telemetry(&self, device_id: &str) -> Result<Vec<Reading>> {
        if self.telemetry_history > 1 {
            self.client
                .fetch_readings(device_id, self.telemetry_history)
                .await
        } else {
            Ok(self
                .client
                .fetch_latest_reading(device_id)
                .await?
                .into_iter()
                .collect())
        }
    }

    fn cache_readings(&self, device_id: &str, readings: Vec<Reading>) {
        if readings.is_empty() || !lock(&self.reconciler).is_tracked(device_id) {
            return;
        }
        let updated = {
            let mut cache = self.telemetry();
            let before = cache.latest(device_id);
            if self.telemetry_history > 1 {
                cache.replace_history(device_id, readings);
            } else if let Some(newest) = readings.into_iter().max_by_key(|r| r.observed_at) {
                cache.replace(device_id, newest);
            }
            let after = cache.latest(device_id);
            if after != before { after } else { None }
        };
        if let Some(reading) = updated {
            self.events.send(SyncEvent::TelemetryUpdated {
                device_id: device_id.to_string(),
                reading,
            });
        }
    }

    fn cache_reading(&self, device_id: &str, reading: Reading) {
        if !lock(&self.reconciler).is_tracked(device_id) {
            return;
        }
        if self.telemetry().replace(device_id, reading) {
            self.events.send(SyncEvent::TelemetryUpdated {
                device_id: device_id.to_string(),
                reading,
            });
        }
    }

    /// Send the pending edit for a device.
    pub(crate) async fn dispatch(&self, device_id: &str) -> DispatchOutcome {
        let outcome = self.dispatcher.dispatch(device_id).await;
        if outcome == DispatchOutcome::SessionExpired {
            self.session_expired();
        }
        outcome
    }

    fn handle_failure(&self, device_id: &str, error: &Error) {
        let outcome = lock(&self.reconciler).record_failure(device_id, error);
        match outcome {
            FailureOutcome::SessionExpired => self.session_expired(),
            FailureOutcome::Transient {
                failures,
                alert: true,
            } => {
                warn!(device_id, failures, "Remote unavailable: {error}");
                self.events.send(SyncEvent::ConnectionDegraded {
                    device_id: device_id.to_string(),
                    failures,
                });
                self.publish_display(device_id);
            }
            FailureOutcome::Transient { failures, .. } => {
                debug!(device_id, failures, "Fetch failed: {error}");
            }
            FailureOutcome::Ignored => {}
        }
    }

    /// Apply one event from a push subscription.
    pub(crate) fn apply_push(self: &Arc<Self>, event: PushEvent) {
        match event {
            PushEvent::Telemetry { device_id, reading } => self.cache_reading(&device_id, reading),
            PushEvent::SetpointChanged {
                device_id,
                setpoint,
            } => {
                let outcome = {
                    let mut reconciler = lock(&self.reconciler);
                    let Some(ticket) = reconciler.issue_ticket(&device_id) else {
                        return;
                    };
                    // Push frames carry no origin; an echo of the confirmed
                    // value keeps the origin already known.
                    let setpoint = match reconciler.confirmed(&device_id) {
                        Some(confirmed)
                            if setpoint.origin == Origin::Unknown
                                && setpoints_equal(confirmed.setpoint, setpoint.setpoint) =>
                        {
                            RemoteSetpoint {
                                origin: confirmed.origin,
                                ..setpoint
                            }
                        }
                        _ => setpoint,
                    };
                    reconciler.reconcile(&ticket, setpoint)
                };
                debug!(device_id, ?outcome, "Reconciled pushed setpoint");
                if outcome.is_visible_change() {
                    self.publish_display(&device_id);
                }
                if matches!(outcome, ReconcileOutcome::Dispatch { .. }) {
                    let core = Arc::clone(self);
                    tokio::spawn(async move {
                        core.dispatch(&device_id).await;
                    });
                }
            }
            PushEvent::Disconnected { device_id, reason } => {
                info!(device_id, "Push connection lost: {reason}");
                self.events
                    .send(SyncEvent::PushDisconnected { device_id, reason });
            }
        }
    }

    /// Stop scheduling and tell observers the credentials were refused.
    pub(crate) fn session_expired(&self) {
        if let Some(token) = self
            .scheduler_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
        if !self.expired.swap(true, Ordering::SeqCst) {
            warn!("Session expired, scheduling stopped");
            self.events.send(SyncEvent::SessionExpired);
        }
    }
}

/// Keeps displayed setpoints consistent with a remote thermostat backend.
pub struct SyncEngine {
    core: Arc<EngineCore>,
    config: SyncConfig,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("devices", &self.device_ids())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine. Fails if `config` does not validate.
    ///
    /// No background task runs until [`start`](Self::start) is called.
    pub fn new(client: Arc<dyn RemoteStateClient>, config: SyncConfig) -> Result<Self> {
        config.check()?;
        let reconciler: SharedReconciler = Arc::new(Mutex::new(
            Reconciler::new(config.bounds).with_alert_after(config.unavailable_alert_after),
        ));
        let events = EventDispatcher::new(config.event_capacity);
        let dispatcher =
            CommandDispatcher::new(Arc::clone(&client), Arc::clone(&reconciler), events.clone());
        let core = EngineCore {
            client,
            wake: Notify::new(),
            telemetry_history: config.telemetry_history,
            reconciler,
            telemetry: Mutex::new(TelemetryCache::new(config.telemetry_history)),
            dispatcher,
            events,
            scheduler_token: Mutex::new(None),
            expired: AtomicBool::new(false),
        };
        Ok(Self {
            core: Arc::new(core),
            config,
            scheduler: Mutex::new(None),
        })
    }

    fn scheduler(&self) -> MutexGuard<'_, Option<SchedulerHandle>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get the event dispatcher.
    pub fn events(&self) -> &EventDispatcher {
        &self.core.events
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> EventReceiver {
        self.core.events.subscribe()
    }

    // --- Observed devices ---

    /// Start observing a device. Returns `false` if it was already observed.
    ///
    /// Nothing is displayed for the device until its first successful sync.
    pub fn watch(&self, device_id: &str) -> bool {
        let added = lock(&self.core.reconciler).track(device_id);
        if added {
            info!(device_id, "Watching device");
            self.core.events.send(SyncEvent::DeviceAdded {
                device_id: device_id.to_string(),
            });
        }
        added
    }

    /// Stop observing a device and discard its state and telemetry.
    ///
    /// Operations still in flight for the device are abandoned; their results
    /// are ignored.
    pub fn unwatch(&self, device_id: &str) -> bool {
        let removed = lock(&self.core.reconciler).untrack(device_id);
        if removed {
            self.core.telemetry().remove(device_id);
            info!(device_id, "Stopped watching device");
            self.core.events.send(SyncEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        }
        removed
    }

    /// List the remote's devices and watch all of them.
    ///
    /// Observed devices the remote no longer lists are deregistered and
    /// unwatched, discarding their state and telemetry.
    pub async fn discover(&self) -> Result<Vec<DeviceSummary>> {
        let devices = self.core.client.list_devices().await.inspect_err(|e| {
            if e.is_session_fatal() {
                self.core.session_expired();
            }
        })?;
        let listed: HashSet<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        for device_id in self.device_ids() {
            if !listed.contains(device_id.as_str()) {
                info!(%device_id, "Device no longer listed by remote");
                self.unwatch(&device_id);
            }
        }
        for device in &devices {
            self.watch(&device.id);
        }
        Ok(devices)
    }

    /// Observed device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        self.core.device_ids()
    }

    // --- Presentation accessors ---

    /// What to render for a device, once it has been synced.
    pub fn display_state(&self, device_id: &str) -> Option<DisplayState> {
        lock(&self.core.reconciler).display_state(device_id)
    }

    /// Full synchronization state for a device.
    pub fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        lock(&self.core.reconciler).device_state(device_id)
    }

    /// Newest cached reading.
    pub fn latest_reading(&self, device_id: &str) -> Option<Reading> {
        self.core.telemetry().latest(device_id)
    }

    /// Cached readings, newest first.
    pub fn reading_history(&self, device_id: &str) -> Vec<Reading> {
        self.core.telemetry().history(device_id)
    }

    // --- User intents ---

    fn after_edit(&self, device_id: &str, target: Option<f64>) -> Option<f64> {
        if target.is_some() {
            self.core.publish_display(device_id);
            self.core.wake.notify_one();
        }
        target
    }

    /// Move the setpoint by `delta` from the last confirmed value.
    ///
    /// Returns the clamped, quantized target now displayed, or `None` if the
    /// device has not been synced yet.
    pub fn request_delta(&self, device_id: &str, delta: f64) -> Option<f64> {
        let target = lock(&self.core.reconciler).request_delta(device_id, delta);
        self.after_edit(device_id, target)
    }

    /// Request an absolute setpoint. See [`request_delta`](Self::request_delta).
    pub fn request_absolute(&self, device_id: &str, value: f64) -> Option<f64> {
        let target = lock(&self.core.reconciler).request_absolute(device_id, value);
        self.after_edit(device_id, target)
    }

    /// Clear the notice shown for a device.
    pub fn dismiss_notice(&self, device_id: &str) -> bool {
        let dismissed = lock(&self.core.reconciler).dismiss_notice(device_id);
        if dismissed {
            self.core.publish_display(device_id);
        }
        dismissed
    }

    // --- Synchronization ---

    /// Fetch and reconcile one device now, writing a pending edit if it is
    /// still wanted.
    pub async fn sync_device(&self, device_id: &str) -> Result<ReconcileOutcome> {
        self.core.sync_device(device_id).await
    }

    /// Sync every observed device concurrently.
    pub async fn sync_all(&self) -> HashMap<String, Result<ReconcileOutcome>> {
        let ids = self.device_ids();
        let syncs = ids.into_iter().map(|id| async move {
            let result = self.core.sync_device(&id).await;
            (id, result)
        });
        join_all(syncs).await.into_iter().collect()
    }

    /// Send the pending edit now, without re-reading the remote first.
    pub async fn dispatch(&self, device_id: &str) -> DispatchOutcome {
        self.core.dispatch(device_id).await
    }

    // --- Scheduling ---

    /// Run the scheduler in `mode`, tearing down any scheduler already running.
    pub fn start(&self, mode: DeliveryMode) {
        let mut scheduler = self.scheduler();
        if let Some(previous) = scheduler.take() {
            previous.stop();
        }
        self.core.expired.store(false, Ordering::SeqCst);

        let cancel_token = CancellationToken::new();
        *self
            .core
            .scheduler_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel_token.clone());
        *scheduler = scheduler::spawn(Arc::clone(&self.core), mode, cancel_token);
        info!(?mode, "Scheduler started");
    }

    /// Run the scheduler in the mode described by the configuration.
    pub fn start_configured(&self) {
        self.start(self.config.delivery_mode());
    }

    /// Stop the scheduler. In-flight operations finish in the background.
    pub fn stop(&self) {
        if let Some(previous) = self.scheduler().take() {
            previous.stop();
            info!("Scheduler stopped");
        }
    }

    /// Whether a scheduler task is running.
    pub fn is_running(&self) -> bool {
        self.scheduler().as_ref().is_some_and(SchedulerHandle::is_running)
    }

    /// Mode of the running scheduler.
    pub fn mode(&self) -> Option<DeliveryMode> {
        self.scheduler()
            .as_ref()
            .filter(|s| s.is_running())
            .map(SchedulerHandle::mode)
    }

    /// Whether the remote refused the credentials since the last start.
    pub fn is_session_expired(&self) -> bool {
        self.core.expired.load(Ordering::SeqCst)
    }

    /// Stop scheduling and forget every device, as on logout.
    pub fn shutdown(&self) {
        self.stop();
        let ids = {
            let mut reconciler = lock(&self.core.reconciler);
            let ids = reconciler.device_ids();
            reconciler.clear();
            ids
        };
        self.core.telemetry().clear();
        for device_id in ids {
            self.core.events.send(SyncEvent::DeviceRemoved { device_id });
        }
        self.core.expired.store(false, Ordering::SeqCst);
        info!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use time::OffsetDateTime;

    use crate::mock::{MockRemote, MockRemoteBuilder};
    use crate::reconciler::SyncPhase;

    fn engine_with(remote: &Arc<MockRemote>, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(remote.clone(), config).unwrap()
    }

    async fn synced(value: f64) -> (Arc<MockRemote>, SyncEngine) {
        let remote = Arc::new(MockRemoteBuilder::new().device("t-1", value).build());
        let engine = engine_with(&remote, SyncConfig::default());
        engine.watch("t-1");
        engine.sync_device("t-1").await.unwrap();
        (remote, engine)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let remote = Arc::new(MockRemote::new());
        let result = SyncEngine::new(remote, SyncConfig::default().poll_interval_secs(1));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_watch_and_first_sync() {
        let remote = Arc::new(MockRemoteBuilder::new().device("t-1", 20.0).build());
        let engine = engine_with(&remote, SyncConfig::default());
        let mut rx = engine.subscribe();

        assert!(engine.watch("t-1"));
        assert!(!engine.watch("t-1"));
        assert!(engine.display_state("t-1").is_none());

        let outcome = engine.sync_device("t-1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Adopted { changed: true });

        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 20.0);
        assert_eq!(display.origin, Origin::App);
        assert!(!display.saving);
        assert!(display.notice.is_none());

        let events = drain(&mut rx);
        assert!(matches!(events[0], SyncEvent::DeviceAdded { .. }));
        assert!(matches!(events[1], SyncEvent::StateChanged { .. }));
    }

    #[tokio::test]
    async fn test_sync_unwatched_device() {
        let remote = Arc::new(MockRemote::new());
        let engine = engine_with(&remote, SyncConfig::default());
        assert!(matches!(
            engine.sync_device("missing").await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_request_before_sync_is_refused() {
        let remote = Arc::new(MockRemoteBuilder::new().device("t-1", 20.0).build());
        let engine = engine_with(&remote, SyncConfig::default());
        engine.watch("t-1");
        assert_eq!(engine.request_delta("t-1", 1.0), None);
    }

    #[tokio::test]
    async fn test_edit_is_written_on_next_sync() {
        let (remote, engine) = synced(20.0).await;

        assert_eq!(engine.request_absolute("t-1", 22.0), Some(22.0));
        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 22.0);
        assert_eq!(display.phase, SyncPhase::Editing);
        assert_eq!(remote.write_count(), 0);

        let outcome = engine.sync_device("t-1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Dispatch {
                target: 22.0,
                overwrite: false
            }
        );
        assert_eq!(remote.write_count(), 1);
        assert_eq!(remote.current("t-1").await.unwrap().setpoint, 22.0);

        let state = engine.device_state("t-1").unwrap();
        assert_eq!(state.setpoint, 22.0);
        assert_eq!(state.origin, Origin::App);
        assert!(state.local_edit.is_none());
        assert!(!state.write_in_flight);
    }

    #[tokio::test]
    async fn test_edit_is_clamped() {
        let (_remote, engine) = synced(20.0).await;
        assert_eq!(engine.request_absolute("t-1", 99.0), Some(30.0));
        assert_eq!(engine.request_absolute("t-1", -4.0), Some(5.0));
        assert_eq!(engine.request_absolute("t-1", 21.26), Some(21.5));
    }

    #[tokio::test]
    async fn test_device_change_discards_edit() {
        let (remote, engine) = synced(20.0).await;
        engine.request_absolute("t-1", 22.0);
        remote.set_device_setpoint("t-1", 19.5).await;

        let outcome = engine.sync_device("t-1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::EditDiscarded {
                remote: 19.5,
                discarded: 22.0
            }
        );
        assert_eq!(remote.write_count(), 0);

        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 19.5);
        assert_eq!(display.origin, Origin::Device);
        assert!(display.notice.unwrap().contains("changed at the device"));
        assert!(engine.device_state("t-1").unwrap().local_edit.is_none());
    }

    #[tokio::test]
    async fn test_app_change_is_overwritten() {
        let (remote, engine) = synced(20.0).await;
        engine.request_delta("t-1", 0.5);
        remote.set_app_setpoint("t-1", 23.0).await;

        let outcome = engine.sync_device("t-1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Dispatch {
                target: 20.5,
                overwrite: true
            }
        );
        assert_eq!(remote.current("t-1").await.unwrap().setpoint, 20.5);
        assert_eq!(engine.display_state("t-1").unwrap().setpoint, 20.5);
    }

    #[tokio::test]
    async fn test_rejected_write_reverts() {
        let (remote, engine) = synced(20.0).await;
        let mut rx = engine.subscribe();
        remote.fail_next_write(Error::rejected("outside device range")).await;
        engine.request_absolute("t-1", 28.0);

        engine.sync_device("t-1").await.unwrap();
        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 20.0);
        assert!(!display.saving);
        assert!(display.notice.unwrap().contains("outside device range"));

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SyncEvent::WriteFailed { .. }))
        );

        // No automatic resend.
        engine.sync_device("t-1").await.unwrap();
        assert_eq!(remote.write_count(), 1);
        assert_eq!(engine.display_state("t-1").unwrap().phase, SyncPhase::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fetch_does_not_overwrite_write() {
        let (remote, engine) = synced(20.0).await;
        let engine = Arc::new(engine);
        remote.set_fetch_latency(Duration::from_millis(500));

        let slow = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.sync_device("t-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        remote.set_fetch_latency(Duration::ZERO);
        engine.request_absolute("t-1", 23.0);
        let outcome = engine.dispatch("t-1").await;
        assert_eq!(
            outcome,
            DispatchOutcome::Confirmed {
                setpoint: 23.0,
                queued: false
            }
        );

        let late = slow.await.unwrap().unwrap();
        assert_eq!(late, ReconcileOutcome::Ignored);
        assert_eq!(engine.display_state("t-1").unwrap().setpoint, 23.0);
    }

    #[tokio::test]
    async fn test_connection_degraded_after_repeated_failures() {
        let (remote, engine) = synced(20.0).await;
        let mut rx = engine.subscribe();
        remote.set_transient_failures(3);

        for _ in 0..3 {
            assert!(engine.sync_device("t-1").await.is_err());
        }
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SyncEvent::ConnectionDegraded { failures: 3, .. }))
                .count(),
            1
        );
        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 20.0);
        assert!(display.notice.unwrap().contains("Connection problem"));

        engine.sync_device("t-1").await.unwrap();
        assert!(engine.display_state("t-1").unwrap().notice.is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_expires_session() {
        let (remote, engine) = synced(20.0).await;
        let mut rx = engine.subscribe();
        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(3600),
        });
        remote.set_unauthorized(true);

        assert_eq!(engine.sync_device("t-1").await, Err(Error::Unauthorized));
        assert!(engine.is_session_expired());
        assert!(!engine.is_running());
        assert!(drain(&mut rx).contains(&SyncEvent::SessionExpired));
    }

    #[tokio::test]
    async fn test_unwatch_discards_state() {
        let remote = Arc::new(
            MockRemoteBuilder::new()
                .device("t-1", 20.0)
                .reading("t-1", Reading::new(20.5, OffsetDateTime::now_utc()))
                .build(),
        );
        let engine = engine_with(&remote, SyncConfig::default());
        engine.watch("t-1");
        engine.sync_device("t-1").await.unwrap();
        assert!(engine.latest_reading("t-1").is_some());

        assert!(engine.unwatch("t-1"));
        assert!(engine.display_state("t-1").is_none());
        assert!(engine.latest_reading("t-1").is_none());
        assert!(!engine.unwatch("t-1"));
    }

    #[tokio::test]
    async fn test_reading_history() {
        let now = OffsetDateTime::now_utc();
        let remote = Arc::new(
            MockRemoteBuilder::new()
                .device("t-1", 20.0)
                .reading("t-1", Reading::new(19.0, now - time::Duration::minutes(2)))
                .reading("t-1", Reading::new(19.5, now - time::Duration::minutes(1)))
                .reading("t-1", Reading::new(20.0, now))
                .build(),
        );
        let engine = engine_with(&remote, SyncConfig::default().telemetry_history(2));
        engine.watch("t-1");
        engine.sync_device("t-1").await.unwrap();

        let history = engine.reading_history("t-1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].temperature, 20.0);
        assert_eq!(history[1].temperature, 19.5);
    }

    #[tokio::test]
    async fn test_discover_watches_remote_devices() {
        let remote = Arc::new(
            MockRemoteBuilder::new()
                .device("a", 20.0)
                .device("b", 21.0)
                .build(),
        );
        let engine = engine_with(&remote, SyncConfig::default());
        let devices = engine.discover().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(engine.device_ids(), vec!["a".to_string(), "b".to_string()]);

        let results = engine.sync_all().await;
        assert!(results.values().all(Result::is_ok));
        assert_eq!(engine.display_state("b").unwrap().setpoint, 21.0);
    }

    #[tokio::test]
    async fn test_discover_drops_deregistered_devices() {
        let remote = Arc::new(
            MockRemoteBuilder::new()
                .device("a", 20.0)
                .device("b", 21.0)
                .build(),
        );
        let engine = engine_with(&remote, SyncConfig::default());
        engine.discover().await.unwrap();
        engine.sync_all().await;
        assert!(engine.display_state("b").is_some());

        remote.remove_device("b").await;
        for _ in 0..5 {
            let results = engine.sync_all().await;
            assert!(matches!(results.get("b"), Some(Err(Error::DeviceNotFound(_)))));
        }

        let mut rx = engine.subscribe();
        let devices = engine.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(engine.device_ids(), vec!["a".to_string()]);
        assert!(engine.display_state("b").is_none());
        assert!(engine.latest_reading("b").is_none());
        assert!(drain(&mut rx).contains(&SyncEvent::DeviceRemoved {
            device_id: "b".to_string()
        }));

        // A later sync for the dropped device is refused rather than counted.
        assert!(matches!(
            engine.sync_device("b").await,
            Err(Error::DeviceNotFound(_))
        ));
        assert!(engine.display_state("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_picks_up_device_change() {
        let (remote, engine) = synced(20.0).await;
        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(5),
        });
        assert!(engine.is_running());

        remote.set_device_setpoint("t-1", 18.0).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 18.0);
        assert_eq!(display.origin, Origin::Device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_wakes_scheduler() {
        let (remote, engine) = synced(20.0).await;
        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(30),
        });
        // Let the immediate first tick run.
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.request_absolute("t-1", 21.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.current("t-1").await.unwrap().setpoint, 21.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_drop_release_scheduler() {
        let (remote, engine) = synced(20.0).await;
        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(5),
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.stop();
        assert!(!engine.is_running());

        remote.reset_counts();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(remote.fetch_count(), 0);

        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(5),
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(engine);
        remote.reset_counts();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(remote.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_delivers_changes() {
        let (remote, engine) = synced(20.0).await;
        let mut rx = engine.subscribe();
        engine.start(DeliveryMode::Push {
            keepalive: Duration::from_secs(30),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        remote.set_device_setpoint("t-1", 17.5).await;
        remote
            .push_reading("t-1", Reading::new(18.2, OffsetDateTime::now_utc()))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let display = engine.display_state("t-1").unwrap();
        assert_eq!(display.setpoint, 17.5);
        assert_eq!(display.origin, Origin::Device);
        assert_eq!(engine.latest_reading("t-1").unwrap().temperature, 18.2);

        remote.drop_push_connection("t-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, SyncEvent::PushDisconnected { .. }))
        );
    }

    #[tokio::test]
    async fn test_shutdown_forgets_devices() {
        let (_remote, engine) = synced(20.0).await;
        engine.start(DeliveryMode::Polling {
            interval: Duration::from_secs(5),
        });
        engine.shutdown();
        assert!(!engine.is_running());
        assert!(engine.device_ids().is_empty());
        assert!(engine.display_state("t-1").is_none());
    }
}
