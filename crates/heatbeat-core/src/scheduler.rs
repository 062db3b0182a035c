//! Reconciliation cadence.
//!
//! One scheduler task drives every device, in one of two modes:
//!
//! - **Polling**: a fixed interval triggers a fetch of every watched device.
//! - **Push**: one [`Subscription`] per device delivers changes as they
//!   happen. A periodic keepalive re-opens dead connections and runs a full
//!   sync so pending edits still go out.
//!
//! In both modes a user edit wakes the scheduler immediately.
//!
//! The task is owned by a [`SchedulerHandle`]. Stopping or dropping the handle
//! cancels the timer and closes every subscription. Syncs already running
//! are left to finish; their results are ignored for devices that were
//! unwatched in the meantime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineCore;
use crate::error::Error;
use crate::push::{PushEvent, Subscription};

/// Buffer for push events shared by all subscriptions.
const PUSH_BUFFER: usize = 64;

/// How the scheduler learns about remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// No background activity. Syncs happen only when requested.
    Disabled,
    /// Fetch every device each `interval`.
    Polling { interval: Duration },
    /// Hold a push subscription per device, with a keepalive sync each period.
    Push { keepalive: Duration },
}

impl DeliveryMode {
    /// Whether this mode runs a background task.
    pub fn is_active(&self) -> bool {
        !matches!(self, DeliveryMode::Disabled)
    }
}

/// Owner of a running scheduler task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct SchedulerHandle {
    mode: DeliveryMode,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Mode this scheduler runs in.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the task without waiting for it.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Cancel the task and wait until its timers and subscriptions are gone.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("Scheduler task ended abnormally: {e}");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Start a scheduler for `mode`. Returns `None` for [`DeliveryMode::Disabled`].
///
/// The task stops when `cancel_token` is cancelled, whether by the returned
/// handle or by the engine on session expiry.
pub(crate) fn spawn(
    core: Arc<EngineCore>,
    mode: DeliveryMode,
    cancel_token: CancellationToken,
) -> Option<SchedulerHandle> {
    let task_token = cancel_token.clone();
    let handle = match mode {
        DeliveryMode::Disabled => return None,
        DeliveryMode::Polling { interval } => {
            tokio::spawn(run_polling(core, interval, task_token))
        }
        DeliveryMode::Push { keepalive } => tokio::spawn(run_push(core, keepalive, task_token)),
    };
    Some(SchedulerHandle {
        mode,
        cancel_token,
        handle: Some(handle),
    })
}

/// Devices with a sync task currently running.
#[derive(Debug, Clone, Default)]
struct InProgress(Arc<Mutex<HashSet<String>>>);

/// Marks a device as syncing until dropped.
struct SyncGuard {
    in_progress: InProgress,
    device_id: String,
}

impl SyncGuard {
    fn acquire(in_progress: &InProgress, device_id: &str) -> Option<Self> {
        let inserted = in_progress
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string());
        inserted.then(|| Self {
            in_progress: in_progress.clone(),
            device_id: device_id.to_string(),
        })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.in_progress
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device_id);
    }
}

/// Spawn one sync per device, skipping devices whose previous sync is still
/// running.
fn spawn_syncs(core: &Arc<EngineCore>, in_progress: &InProgress, device_ids: Vec<String>) {
    for device_id in device_ids {
        let Some(guard) = SyncGuard::acquire(in_progress, &device_id) else {
            debug!(device_id, "Previous sync still running, skipping");
            continue;
        };
        let core = Arc::clone(core);
        tokio::spawn(async move {
            if let Err(e) = core.sync_device(&guard.device_id).await {
                debug!(device_id = %guard.device_id, "Sync failed: {e}");
            }
        });
    }
}

async fn run_polling(core: Arc<EngineCore>, period: Duration, cancel_token: CancellationToken) {
    info!(interval_secs = period.as_secs(), "Polling scheduler started");
    let in_progress = InProgress::default();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => spawn_syncs(&core, &in_progress, core.device_ids()),
            _ = core.wake.notified() => {
                spawn_syncs(&core, &in_progress, core.pending_device_ids());
            }
        }
    }
    info!("Polling scheduler stopped");
}

async fn run_push(core: Arc<EngineCore>, keepalive: Duration, cancel_token: CancellationToken) {
    info!(keepalive_secs = keepalive.as_secs(), "Push scheduler started");
    let in_progress = InProgress::default();
    let (sink, mut events) = mpsc::channel(PUSH_BUFFER);
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let mut ticker = interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                refresh_subscriptions(&core, &mut subscriptions, &sink).await;
                spawn_syncs(&core, &in_progress, core.device_ids());
            }
            _ = core.wake.notified() => {
                spawn_syncs(&core, &in_progress, core.pending_device_ids());
            }
            Some(event) = events.recv() => {
                if let PushEvent::Disconnected { device_id, .. } = &event {
                    forget_dead_subscription(&mut subscriptions, device_id);
                }
                core.apply_push(event);
            }
        }
    }

    let open = subscriptions.len();
    subscriptions.clear();
    info!(closed_subscriptions = open, "Push scheduler stopped");
}

/// Drop the subscription for `device_id` if its connection is gone.
///
/// A disconnect may be delivered after the keepalive already replaced the
/// subscription, so a live one is kept. A dead one still finishing its task
/// is dropped by the next refresh.
fn forget_dead_subscription(subscriptions: &mut HashMap<String, Subscription>, device_id: &str) {
    if subscriptions.get(device_id).is_some_and(|sub| !sub.is_active()) {
        subscriptions.remove(device_id);
    }
}

/// Drop subscriptions for unwatched devices or dead connections and open the
/// missing ones.
async fn refresh_subscriptions(
    core: &Arc<EngineCore>,
    subscriptions: &mut HashMap<String, Subscription>,
    sink: &mpsc::Sender<PushEvent>,
) {
    let watched: HashSet<String> = core.device_ids().into_iter().collect();
    subscriptions.retain(|device_id, sub| watched.contains(device_id) && sub.is_active());

    for device_id in watched {
        if subscriptions.contains_key(&device_id) {
            continue;
        }
        match core.client.subscribe(&device_id, sink.clone()).await {
            Ok(subscription) => {
                debug!(device_id, "Push subscription opened");
                subscriptions.insert(device_id, subscription);
            }
            Err(Error::Unauthorized) => {
                core.session_expired();
                return;
            }
            Err(Error::Unsupported(what)) => {
                debug!("Remote does not support {what}; relying on keepalive syncs");
                return;
            }
            Err(e) => warn!(device_id, "Could not open push subscription: {e}"),
        }
    }
}
