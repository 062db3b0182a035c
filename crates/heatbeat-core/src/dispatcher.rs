//! Outbound setpoint writes.
//!
//! The [`CommandDispatcher`] turns an accepted local edit into one write
//! through the [`RemoteStateClient`]. The reconciler's in-flight flag is
//! taken before the write starts, so at most one write per device is ever
//! outstanding regardless of how many tasks call [`CommandDispatcher::dispatch`].
//!
//! An edit queued while a write is in flight is not sent from the completion
//! path. The next reconciliation tick picks it up.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;
use crate::events::{EventDispatcher, SyncEvent};
use crate::reconciler::{SharedReconciler, WriteOutcome, lock};
use crate::traits::RemoteStateClient;

/// Result of one [`CommandDispatcher::dispatch`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No edit was waiting.
    NothingPending,
    /// A write for this device is already outstanding.
    AlreadyInFlight,
    /// The remote stored `setpoint`; `queued` if a newer edit is waiting.
    Confirmed { setpoint: f64, queued: bool },
    /// The write failed and the display was rolled back.
    Failed(Error),
    /// Credentials were refused.
    SessionExpired,
    /// The device was removed while the write was outstanding.
    Ignored,
}

/// Sends pending edits upstream, one per device at a time.
#[derive(Clone)]
pub struct CommandDispatcher {
    client: Arc<dyn RemoteStateClient>,
    reconciler: SharedReconciler,
    events: EventDispatcher,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher over a shared reconciler.
    pub fn new(
        client: Arc<dyn RemoteStateClient>,
        reconciler: SharedReconciler,
        events: EventDispatcher,
    ) -> Self {
        Self {
            client,
            reconciler,
            events,
        }
    }

    fn publish_display(&self, device_id: &str) {
        let display = lock(&self.reconciler).display_state(device_id);
        if let Some(display) = display {
            self.events.send(SyncEvent::StateChanged { display });
        }
    }

    /// Send the pending edit for `device_id`, if any, and wait for the result.
    pub async fn dispatch(&self, device_id: &str) -> DispatchOutcome {
        let ticket = {
            let mut reconciler = lock(&self.reconciler);
            match reconciler.begin_dispatch(device_id) {
                Some(ticket) => ticket,
                None => {
                    let in_flight = reconciler
                        .device_state(device_id)
                        .is_some_and(|s| s.write_in_flight);
                    return if in_flight {
                        DispatchOutcome::AlreadyInFlight
                    } else {
                        DispatchOutcome::NothingPending
                    };
                }
            }
        };
        self.publish_display(device_id);
        debug!(device_id, seq = ticket.seq, target = ticket.target, "Dispatching setpoint");

        let result = self
            .client
            .write_setpoint(&ticket.device_id, ticket.target)
            .await;

        let outcome = lock(&self.reconciler).complete_write(&ticket, result);
        match outcome {
            WriteOutcome::Ignored => {
                debug!(device_id, "Write result discarded, device no longer observed");
                DispatchOutcome::Ignored
            }
            WriteOutcome::Confirmed { setpoint, queued } => {
                self.publish_display(device_id);
                DispatchOutcome::Confirmed { setpoint, queued }
            }
            WriteOutcome::Failed { error } => {
                self.publish_display(device_id);
                self.events.send(SyncEvent::WriteFailed {
                    device_id: device_id.to_string(),
                    error: error.to_string(),
                });
                DispatchOutcome::Failed(error)
            }
            WriteOutcome::SessionExpired => {
                warn!(device_id, "Write refused: session expired");
                self.publish_display(device_id);
                DispatchOutcome::SessionExpired
            }
        }
    }
}
