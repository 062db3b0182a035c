//! Change notifications for presentation adapters.
//!
//! The engine publishes a [`SyncEvent`] whenever a device's state changes, so
//! a front end can re-render without polling the core.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use heatbeat_types::Reading;

use crate::reconciler::DisplayState;

/// Events emitted by the synchronization engine.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A device joined the observed set.
    DeviceAdded { device_id: String },
    /// A device left the observed set and its state was discarded.
    DeviceRemoved { device_id: String },
    /// What should be displayed for a device changed.
    StateChanged { display: DisplayState },
    /// A new telemetry sample is cached.
    TelemetryUpdated { device_id: String, reading: Reading },
    /// A write failed and was rolled back.
    WriteFailed { device_id: String, error: String },
    /// Fetches keep failing; the last known value is still shown.
    ConnectionDegraded { device_id: String, failures: u32 },
    /// A push connection dropped and will be re-opened on the next keepalive.
    PushDisconnected { device_id: String, reason: String },
    /// Credentials were refused. Scheduling has stopped.
    SessionExpired,
}

impl SyncEvent {
    /// Device this event concerns, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            SyncEvent::DeviceAdded { device_id }
            | SyncEvent::DeviceRemoved { device_id }
            | SyncEvent::TelemetryUpdated { device_id, .. }
            | SyncEvent::WriteFailed { device_id, .. }
            | SyncEvent::ConnectionDegraded { device_id, .. }
            | SyncEvent::PushDisconnected { device_id, .. } => Some(device_id),
            SyncEvent::StateChanged { display } => Some(&display.device_id),
            SyncEvent::SessionExpired => None,
        }
    }
}

/// Sender for sync events.
pub type EventSender = broadcast::Sender<SyncEvent>;

/// Receiver for sync events.
pub type EventReceiver = broadcast::Receiver<SyncEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SyncEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
