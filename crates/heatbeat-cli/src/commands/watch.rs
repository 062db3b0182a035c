//! Watch command implementation.

use anyhow::{Result, bail};
use heatbeat_core::{Delivery, DeliveryMode, SyncEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cli::WatchArgs;
use crate::format::format_event;
use crate::util::Session;

fn describe(mode: DeliveryMode) -> String {
    match mode {
        DeliveryMode::Disabled => "one initial fetch".to_string(),
        DeliveryMode::Polling { interval } => format!("polling every {}s", interval.as_secs()),
        DeliveryMode::Push { .. } => "push".to_string(),
    }
}

pub async fn cmd_watch(session: &Session, args: WatchArgs) -> Result<()> {
    let mut sync = session.config.sync.clone();
    if args.push {
        let keepalive_secs = sync.keepalive_secs;
        sync = sync.push(keepalive_secs);
    } else if let Some(interval) = args.interval {
        sync.delivery = Delivery::Polling;
        sync = sync.poll_interval_secs(interval);
    }

    let engine = session.engine(session.client()?, sync)?;
    let mut events = engine.subscribe();
    let devices = session.devices_or_discover(&engine, args.devices).await?;

    for (device_id, result) in engine.sync_all().await {
        if let Err(e) = result {
            if e.is_session_fatal() {
                bail!("{device_id}: {e}");
            }
            warn!(%device_id, "Initial sync failed: {e}");
        }
    }

    engine.start_configured();
    if !session.quiet {
        eprintln!(
            "Watching {} thermostat(s), {}. Press Ctrl-C to stop.",
            devices.len(),
            describe(engine.config().delivery_mode())
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::SessionExpired) => {
                    engine.shutdown();
                    bail!("Session expired: the backend refused the token");
                }
                Ok(event) => {
                    if let Some(line) = format_event(&event, &session.opts) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown();
    Ok(())
}
