//! Set and nudge command implementation.

use anyhow::{Context, Result, anyhow, bail};
use heatbeat_core::{DispatchOutcome, DisplayState, SyncEngine};

use crate::format::format_display;
use crate::util::Session;

/// A requested setpoint change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Edit {
    /// Go to this value.
    Absolute(f64),
    /// Move by this much from the confirmed value.
    Delta(f64),
}

pub async fn cmd_set(session: &Session, device: &str, edit: Edit) -> Result<()> {
    let engine = session.engine(session.client()?, session.config.sync.clone())?;
    let display = apply_edit(&engine, device, edit).await?;
    println!("{}", format_display(&display, &session.opts));
    Ok(())
}

/// Sync `device`, apply `edit` and wait for the backend to confirm it.
///
/// Returns the display state after the write. If the device already holds
/// the requested value nothing is written.
async fn apply_edit(engine: &SyncEngine, device: &str, edit: Edit) -> Result<DisplayState> {
    let (Edit::Absolute(value) | Edit::Delta(value)) = edit;
    if !value.is_finite() {
        bail!("{value} is not a finite temperature");
    }
    engine.watch(device);
    engine
        .sync_device(device)
        .await
        .with_context(|| format!("Failed to read thermostat {device}"))?;

    let target = match edit {
        Edit::Absolute(value) => engine.request_absolute(device, value),
        Edit::Delta(delta) => engine.request_delta(device, delta),
    }
    .ok_or_else(|| anyhow!("Thermostat {device} has no confirmed setpoint yet"))?;
    if let Edit::Absolute(value) = edit
        && (value - target).abs() > f64::EPSILON
    {
        tracing::info!(device, requested = value, target, "Setpoint adjusted to bounds");
    }

    match engine.dispatch(device).await {
        DispatchOutcome::Confirmed { .. } | DispatchOutcome::NothingPending => {}
        DispatchOutcome::Failed(e) => {
            return Err(e).with_context(|| format!("Failed to set {device} to {target:.1}°C"));
        }
        DispatchOutcome::SessionExpired => bail!("Session expired: the backend refused the token"),
        DispatchOutcome::AlreadyInFlight => bail!("Another write to {device} is still in flight"),
        DispatchOutcome::Ignored => bail!("Thermostat {device} is no longer watched"),
    }

    engine
        .display_state(device)
        .ok_or_else(|| anyhow!("Thermostat {device} has no state"))
}
