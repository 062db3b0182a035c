//! Setpoint reconciliation.
//!
//! The [`Reconciler`] is the single authority on what setpoint is displayed
//! for each device and whether a local edit goes upstream. It performs no
//! I/O: callers feed it remote results and it answers with outcomes, so every
//! decision is synchronous and testable.
//!
//! Per device it runs a small state machine:
//!
//! ```text
//! Synced --edit--> Editing --begin_dispatch--> Dispatching --ok--> Synced
//!    ^                                              |
//!    +------------- next reconcile ---- Conflicted <-- err
//! ```
//!
//! Every fetch is tagged with an [`OpTicket`] drawn from one monotonic
//! counter. A result is applied only if its ticket is newer than the last
//! applied one and was issued after the last confirmed write, so a slow fetch
//! can never overwrite a write's result.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use heatbeat_types::{Origin, RemoteSetpoint, SetpointBounds, ThermostatMode, setpoints_equal};

use crate::error::{Error, ErrorKind};

/// Number of consecutive transient failures before a notice is raised.
pub const DEFAULT_UNAVAILABLE_ALERT_AFTER: u32 = 3;

/// Reconciler shared between the engine, dispatcher and scheduler.
pub type SharedReconciler = Arc<Mutex<Reconciler>>;

/// Lock the shared reconciler.
///
/// The guard must never be held across an `.await`. Every mutation completes
/// before the lock is released, so a poisoned lock still holds consistent
/// state and is recovered.
pub(crate) fn lock(shared: &Mutex<Reconciler>) -> MutexGuard<'_, Reconciler> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-device synchronization phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Local value equals the remote value and nothing is pending.
    Synced,
    /// The user changed the value; not yet sent.
    Editing,
    /// A write is outstanding.
    Dispatching,
    /// The last write failed and the value was rolled back.
    Conflicted,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Synced => "synced",
            SyncPhase::Editing => "editing",
            SyncPhase::Dispatching => "saving",
            SyncPhase::Conflicted => "conflicted",
        };
        f.write_str(s)
    }
}

/// Explanatory message attached to a device for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// A pending edit was dropped because the value was changed on the thermostat.
    ChangedAtDevice { remote: f64, discarded: f64 },
    /// Another session changed the value; the pending edit replaces it.
    Overwriting { remote: f64, target: f64 },
    /// The remote refused the value.
    WriteRejected { reason: String },
    /// The write did not reach the remote.
    WriteFailed { reason: String },
    /// Several fetches in a row failed.
    ConnectionProblem { failures: u32 },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ChangedAtDevice { remote, discarded } => write!(
                f,
                "Setpoint was changed at the device to {remote:.1}°C; your change to {discarded:.1}°C was discarded"
            ),
            Notice::Overwriting { remote, target } => write!(
                f,
                "Setpoint was changed elsewhere to {remote:.1}°C; overwriting with {target:.1}°C"
            ),
            Notice::WriteRejected { reason } => write!(f, "Change rejected: {reason}"),
            Notice::WriteFailed { reason } => write!(f, "Could not save change: {reason}"),
            Notice::ConnectionProblem { failures } => {
                write!(f, "Connection problem ({failures} failed updates); showing last known value")
            }
        }
    }
}

/// Snapshot of one device's synchronization state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    /// Value currently shown, optimistic while an edit is pending.
    pub setpoint: f64,
    /// Who produced the accepted setpoint.
    pub origin: Origin,
    #[serde(with = "time::serde::rfc3339")]
    pub last_confirmed_at: OffsetDateTime,
    /// Value requested by the user and not yet confirmed.
    pub local_edit: Option<f64>,
    pub write_in_flight: bool,
}

/// What the presentation layer renders for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayState {
    pub device_id: String,
    pub setpoint: f64,
    pub origin: Origin,
    /// True while a write is outstanding.
    pub saving: bool,
    pub notice: Option<String>,
    pub phase: SyncPhase,
    pub mode: Option<ThermostatMode>,
    /// Edit waiting to be sent, if any.
    pub pending: Option<f64>,
}

/// Sequence tag for an outstanding remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpTicket {
    pub device_id: String,
    pub seq: u64,
}

/// A write handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTicket {
    pub device_id: String,
    pub seq: u64,
    pub target: f64,
}

/// Result of feeding a remote value to [`Reconciler::reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Device not tracked or ticket stale; nothing changed.
    Ignored,
    /// A write is in flight; the value will be re-read after it completes.
    Deferred,
    /// The remote value was adopted.
    Adopted { changed: bool },
    /// The pending edit already matches the remote value.
    EditSatisfied,
    /// The pending edit was dropped in favor of a device-side change.
    EditDiscarded { remote: f64, discarded: f64 },
    /// The pending edit should be written now.
    Dispatch { target: f64, overwrite: bool },
}

impl ReconcileOutcome {
    /// Whether the displayed state may have changed.
    pub fn is_visible_change(&self) -> bool {
        match self {
            ReconcileOutcome::Ignored | ReconcileOutcome::Deferred => false,
            ReconcileOutcome::Adopted { changed } => *changed,
            ReconcileOutcome::EditSatisfied
            | ReconcileOutcome::EditDiscarded { .. }
            | ReconcileOutcome::Dispatch { .. } => true,
        }
    }
}

/// Result of [`Reconciler::complete_write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Device no longer tracked or ticket does not match the outstanding write.
    Ignored,
    /// The remote stored `setpoint`. `queued` is set when another edit arrived meanwhile.
    Confirmed { setpoint: f64, queued: bool },
    /// The write failed and the display was rolled back.
    Failed { error: Error },
    /// The session is no longer authorized.
    SessionExpired,
}

/// Result of [`Reconciler::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Device not tracked.
    Ignored,
    /// Counted; `alert` is true exactly when the threshold is reached.
    Transient { failures: u32, alert: bool },
    /// The session is no longer authorized.
    SessionExpired,
}

#[derive(Debug)]
struct Entry {
    state: Option<DeviceState>,
    confirmed: Option<RemoteSetpoint>,
    edit_base: Option<f64>,
    in_flight: Option<WriteTicket>,
    phase: SyncPhase,
    notice: Option<Notice>,
    mode: Option<ThermostatMode>,
    last_applied_seq: u64,
    stale_before: u64,
    consecutive_failures: u32,
}

impl Entry {
    fn new(stale_before: u64) -> Self {
        Self {
            state: None,
            confirmed: None,
            edit_base: None,
            in_flight: None,
            phase: SyncPhase::Synced,
            notice: None,
            mode: None,
            last_applied_seq: 0,
            stale_before,
            consecutive_failures: 0,
        }
    }

    fn is_stale(&self, seq: u64) -> bool {
        seq < self.stale_before || seq <= self.last_applied_seq
    }

    fn adopt(&mut self, remote: RemoteSetpoint) {
        if let Some(state) = self.state.as_mut() {
            state.setpoint = remote.setpoint;
            state.origin = remote.origin;
            state.last_confirmed_at = remote.confirmed_at;
            state.local_edit = None;
        }
        self.confirmed = Some(remote);
        self.edit_base = None;
        self.phase = SyncPhase::Synced;
    }

    fn clear_connection_notice(&mut self) {
        if matches!(self.notice, Some(Notice::ConnectionProblem { .. })) {
            self.notice = None;
        }
    }
}

/// Owns per-device synchronization state.
#[derive(Debug)]
pub struct Reconciler {
    bounds: SetpointBounds,
    alert_after: u32,
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(SetpointBounds::default())
    }
}

impl Reconciler {
    /// Create a reconciler with the given bounds.
    pub fn new(bounds: SetpointBounds) -> Self {
        Self {
            bounds,
            alert_after: DEFAULT_UNAVAILABLE_ALERT_AFTER,
            next_seq: 1,
            entries: HashMap::new(),
        }
    }

    /// Set how many consecutive transient failures raise a notice.
    #[must_use]
    pub fn with_alert_after(mut self, failures: u32) -> Self {
        self.alert_after = failures.max(1);
        self
    }

    /// Setpoint bounds in use.
    pub fn bounds(&self) -> &SetpointBounds {
        &self.bounds
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    // --- Device set ---

    /// Start tracking a device. Returns `false` if it was already tracked.
    ///
    /// Tickets issued before this call are never applied to the new entry.
    pub fn track(&mut self, device_id: &str) -> bool {
        if self.entries.contains_key(device_id) {
            return false;
        }
        let stale_before = self.next_seq;
        self.entries
            .insert(device_id.to_string(), Entry::new(stale_before));
        true
    }

    /// Stop tracking a device and discard its state.
    pub fn untrack(&mut self, device_id: &str) -> bool {
        self.entries.remove(device_id).is_some()
    }

    /// Discard every device.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether a device is tracked.
    pub fn is_tracked(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    /// Tracked device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    // --- Reads ---

    /// Tag a fetch about to be issued. `None` if the device is not tracked.
    pub fn issue_ticket(&mut self, device_id: &str) -> Option<OpTicket> {
        if !self.entries.contains_key(device_id) {
            return None;
        }
        let seq = self.bump_seq();
        Some(OpTicket {
            device_id: device_id.to_string(),
            seq,
        })
    }

    /// Resolve a fetched remote value against local state.
    pub fn reconcile(&mut self, ticket: &OpTicket, remote: RemoteSetpoint) -> ReconcileOutcome {
        let Some(value) = self.bounds.clamp_quantize(remote.setpoint) else {
            warn!(device_id = %ticket.device_id, "Ignoring non-finite remote setpoint");
            return ReconcileOutcome::Ignored;
        };
        let Some(entry) = self.entries.get_mut(&ticket.device_id) else {
            return ReconcileOutcome::Ignored;
        };
        if entry.is_stale(ticket.seq) {
            debug!(device_id = %ticket.device_id, seq = ticket.seq, "Discarding stale fetch result");
            return ReconcileOutcome::Ignored;
        }
        if entry.in_flight.is_some() {
            debug!(device_id = %ticket.device_id, seq = ticket.seq, "Write in flight, deferring fetch result");
            return ReconcileOutcome::Deferred;
        }

        let remote = RemoteSetpoint {
            setpoint: value,
            ..remote
        };
        entry.last_applied_seq = ticket.seq;
        entry.consecutive_failures = 0;
        entry.clear_connection_notice();
        if remote.mode.is_some() {
            entry.mode = remote.mode;
        }

        if entry.state.is_none() {
            entry.state = Some(DeviceState {
                device_id: ticket.device_id.clone(),
                setpoint: value,
                origin: remote.origin,
                last_confirmed_at: remote.confirmed_at,
                local_edit: None,
                write_in_flight: false,
            });
            entry.adopt(remote);
            return ReconcileOutcome::Adopted { changed: true };
        }
        let Some(state) = entry.state.as_ref() else {
            return ReconcileOutcome::Ignored;
        };

        let Some(edit) = state.local_edit else {
            let changed = !setpoints_equal(state.setpoint, value)
                || state.origin != remote.origin
                || entry.phase != SyncPhase::Synced;
            entry.adopt(remote);
            return ReconcileOutcome::Adopted { changed };
        };

        if setpoints_equal(edit, value) {
            entry.adopt(remote);
            return ReconcileOutcome::EditSatisfied;
        }

        let base = entry
            .edit_base
            .or_else(|| entry.confirmed.map(|c| c.setpoint))
            .unwrap_or(value);

        if setpoints_equal(value, base) {
            if let Some(state) = entry.state.as_mut() {
                state.origin = remote.origin;
                state.last_confirmed_at = remote.confirmed_at;
            }
            entry.confirmed = Some(remote);
            return ReconcileOutcome::Dispatch {
                target: edit,
                overwrite: false,
            };
        }

        match remote.origin {
            Origin::Device => {
                info!(
                    device_id = %ticket.device_id,
                    remote = value,
                    discarded = edit,
                    "Setpoint changed at the device, discarding local edit"
                );
                entry.adopt(remote);
                entry.notice = Some(Notice::ChangedAtDevice {
                    remote: value,
                    discarded: edit,
                });
                ReconcileOutcome::EditDiscarded {
                    remote: value,
                    discarded: edit,
                }
            }
            Origin::App | Origin::Unknown => {
                info!(
                    device_id = %ticket.device_id,
                    remote = value,
                    target = edit,
                    "Setpoint changed elsewhere, overwriting with local edit"
                );
                if let Some(state) = entry.state.as_mut() {
                    state.origin = remote.origin;
                    state.last_confirmed_at = remote.confirmed_at;
                }
                entry.confirmed = Some(remote);
                entry.edit_base = Some(value);
                entry.notice = Some(Notice::Overwriting {
                    remote: value,
                    target: edit,
                });
                ReconcileOutcome::Dispatch {
                    target: edit,
                    overwrite: true,
                }
            }
        }
    }

    /// Count a failed fetch.
    pub fn record_failure(&mut self, device_id: &str, error: &Error) -> FailureOutcome {
        if error.is_session_fatal() {
            return FailureOutcome::SessionExpired;
        }
        let alert_after = self.alert_after;
        let Some(entry) = self.entries.get_mut(device_id) else {
            return FailureOutcome::Ignored;
        };
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let failures = entry.consecutive_failures;
        let alert = failures == alert_after;
        if alert {
            entry.notice = Some(Notice::ConnectionProblem { failures });
        } else if let Some(Notice::ConnectionProblem { failures: shown }) = entry.notice.as_mut() {
            *shown = failures;
        }
        FailureOutcome::Transient { failures, alert }
    }

    // --- User intents ---

    /// Move the setpoint by `delta` from the last confirmed value.
    ///
    /// Repeated calls before a dispatch replace each other rather than
    /// accumulate. Returns the target for optimistic display, or `None` if
    /// the device has no confirmed value yet or `delta` is not finite.
    pub fn request_delta(&mut self, device_id: &str, delta: f64) -> Option<f64> {
        if !delta.is_finite() {
            return None;
        }
        let base = self.entries.get(device_id)?.confirmed?.setpoint;
        self.request_absolute(device_id, base + delta)
    }

    /// Request an absolute setpoint. Same clamping and return value as
    /// [`request_delta`](Self::request_delta).
    pub fn request_absolute(&mut self, device_id: &str, value: f64) -> Option<f64> {
        let target = self.bounds.clamp_quantize(value)?;
        let entry = self.entries.get_mut(device_id)?;
        let confirmed = entry.confirmed?.setpoint;
        let state = entry.state.as_mut()?;

        if matches!(
            entry.notice,
            Some(Notice::ChangedAtDevice { .. }) | Some(Notice::WriteRejected { .. }) | Some(Notice::WriteFailed { .. })
        ) {
            entry.notice = None;
        }

        if state.write_in_flight {
            // Supersedes any queued edit; sent after the outstanding write lands.
            state.local_edit = Some(target);
            state.setpoint = target;
            return Some(target);
        }

        if setpoints_equal(target, confirmed) {
            state.local_edit = None;
            state.setpoint = confirmed;
            entry.edit_base = None;
            if entry.phase == SyncPhase::Editing {
                entry.phase = SyncPhase::Synced;
            }
            return Some(confirmed);
        }

        state.local_edit = Some(target);
        state.setpoint = target;
        entry.edit_base = Some(confirmed);
        entry.phase = SyncPhase::Editing;
        Some(target)
    }

    /// Clear the notice for a device.
    pub fn dismiss_notice(&mut self, device_id: &str) -> bool {
        self.entries
            .get_mut(device_id)
            .and_then(|e| e.notice.take())
            .is_some()
    }

    // --- Writes ---

    /// Whether an edit is waiting and no write is outstanding.
    pub fn has_pending_edit(&self, device_id: &str) -> bool {
        self.entries
            .get(device_id)
            .and_then(|e| e.state.as_ref())
            .is_some_and(|s| s.local_edit.is_some() && !s.write_in_flight)
    }

    /// Take the pending edit for sending.
    ///
    /// Returns `None` when nothing is pending or a write is already
    /// outstanding, which makes a second concurrent write impossible.
    pub fn begin_dispatch(&mut self, device_id: &str) -> Option<WriteTicket> {
        let seq = self.next_seq;
        let entry = self.entries.get_mut(device_id)?;
        let state = entry.state.as_mut()?;
        if state.write_in_flight {
            return None;
        }
        let target = state.local_edit.take()?;
        state.write_in_flight = true;
        state.setpoint = target;
        self.next_seq += 1;

        let ticket = WriteTicket {
            device_id: device_id.to_string(),
            seq,
            target,
        };
        entry.in_flight = Some(ticket.clone());
        entry.edit_base = None;
        entry.phase = SyncPhase::Dispatching;
        Some(ticket)
    }

    /// Apply the outcome of a write started with [`begin_dispatch`](Self::begin_dispatch).
    pub fn complete_write(
        &mut self,
        ticket: &WriteTicket,
        result: Result<RemoteSetpoint, Error>,
    ) -> WriteOutcome {
        let next_seq = self.next_seq;
        let bounds = self.bounds;
        let Some(entry) = self.entries.get_mut(&ticket.device_id) else {
            debug!(device_id = %ticket.device_id, "Write completed for untracked device");
            return WriteOutcome::Ignored;
        };
        if entry.in_flight.as_ref().map(|t| t.seq) != Some(ticket.seq) {
            return WriteOutcome::Ignored;
        }
        entry.in_flight = None;
        let Some(state) = entry.state.as_mut() else {
            return WriteOutcome::Ignored;
        };
        state.write_in_flight = false;

        let echoed = result.and_then(|remote| {
            bounds
                .clamp_quantize(remote.setpoint)
                .map(|setpoint| RemoteSetpoint {
                    setpoint,
                    origin: Origin::App,
                    ..remote
                })
                .ok_or_else(|| Error::malformed("non-finite setpoint in write response"))
        });

        match echoed {
            Ok(remote) => {
                let value = remote.setpoint;
                state.origin = Origin::App;
                state.last_confirmed_at = remote.confirmed_at;
                let queued = match state.local_edit {
                    Some(edit) if !setpoints_equal(edit, value) => {
                        state.setpoint = edit;
                        true
                    }
                    _ => {
                        state.local_edit = None;
                        state.setpoint = value;
                        false
                    }
                };
                if remote.mode.is_some() {
                    entry.mode = remote.mode;
                }
                entry.confirmed = Some(remote);
                entry.last_applied_seq = entry.last_applied_seq.max(ticket.seq);
                entry.stale_before = next_seq;
                entry.consecutive_failures = 0;
                if matches!(entry.notice, Some(Notice::Overwriting { .. })) {
                    entry.notice = None;
                }
                if queued {
                    entry.edit_base = Some(value);
                    entry.phase = SyncPhase::Editing;
                } else {
                    entry.edit_base = None;
                    entry.phase = SyncPhase::Synced;
                }
                info!(device_id = %ticket.device_id, setpoint = value, "Setpoint confirmed");
                WriteOutcome::Confirmed {
                    setpoint: value,
                    queued,
                }
            }
            Err(error) => {
                if let Some(confirmed) = entry.confirmed {
                    state.setpoint = confirmed.setpoint;
                    state.origin = confirmed.origin;
                    state.last_confirmed_at = confirmed.confirmed_at;
                }
                state.local_edit = None;
                entry.edit_base = None;
                entry.phase = SyncPhase::Conflicted;
                entry.notice = Some(match error.kind() {
                    ErrorKind::Rejected => Notice::WriteRejected {
                        reason: match &error {
                            Error::Rejected { reason } => reason.clone(),
                            other => other.to_string(),
                        },
                    },
                    _ => Notice::WriteFailed {
                        reason: error.to_string(),
                    },
                });
                warn!(
                    device_id = %ticket.device_id,
                    target = ticket.target,
                    "Write failed, reverted to last confirmed value: {error}"
                );
                if error.is_session_fatal() {
                    WriteOutcome::SessionExpired
                } else {
                    WriteOutcome::Failed { error }
                }
            }
        }
    }

    // --- Accessors ---

    /// Current state for a device, once it has been fetched.
    pub fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.entries.get(device_id)?.state.clone()
    }

    /// Last value the remote confirmed.
    pub fn confirmed(&self, device_id: &str) -> Option<RemoteSetpoint> {
        self.entries.get(device_id)?.confirmed
    }

    /// Phase for a device.
    pub fn phase(&self, device_id: &str) -> Option<SyncPhase> {
        self.entries.get(device_id).map(|e| e.phase)
    }

    /// Active notice for a device.
    pub fn notice(&self, device_id: &str) -> Option<Notice> {
        self.entries.get(device_id)?.notice.clone()
    }

    /// What to render for a device.
    pub fn display_state(&self, device_id: &str) -> Option<DisplayState> {
        let entry = self.entries.get(device_id)?;
        let state = entry.state.as_ref()?;
        Some(DisplayState {
            device_id: device_id.to_string(),
            setpoint: state.setpoint,
            origin: state.origin,
            saving: state.write_in_flight,
            notice: entry.notice.as_ref().map(ToString::to_string),
            phase: entry.phase,
            mode: entry.mode,
            pending: state.local_edit,
        })
    }
}
