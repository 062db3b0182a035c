//! Status command implementation.

use anyhow::Result;
use heatbeat_core::{DisplayState, Reading, SyncEngine};
use owo_colors::OwoColorize;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_display, format_reading};
use crate::util::Session;

#[derive(Debug, Serialize)]
struct StatusReport {
    url: String,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    health_error: Option<String>,
    devices: Vec<DeviceStatus>,
}

#[derive(Debug, Serialize)]
struct DeviceStatus {
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<DisplayState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reading: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn cmd_status(session: &Session, format: OutputFormat) -> Result<()> {
    let client = session.client()?;
    let (healthy, server_time, health_error) = match client.health().await {
        Ok(health) => (
            health.is_ok(),
            health.server_time().and_then(|t| t.format(&Rfc3339).ok()),
            None,
        ),
        Err(e) => (false, None, Some(e.to_string())),
    };

    let engine = session.engine(client, session.config.sync.clone())?;
    let devices = if healthy {
        collect_devices(session, &engine).await?
    } else {
        Vec::new()
    };

    let report = StatusReport {
        url: session.url.clone(),
        healthy,
        server_time,
        health_error,
        devices,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", format_status_text(&report, &session.opts)),
    }
    Ok(())
}

async fn collect_devices(session: &Session, engine: &SyncEngine) -> Result<Vec<DeviceStatus>> {
    let ids = session.devices_or_discover(engine, Vec::new()).await?;
    let mut results = engine.sync_all().await;
    Ok(ids
        .into_iter()
        .map(|device_id| {
            let error = match results.remove(&device_id) {
                Some(Err(e)) => Some(e.to_string()),
                _ => None,
            };
            DeviceStatus {
                state: engine.display_state(&device_id),
                reading: engine.latest_reading(&device_id),
                error,
                device_id,
            }
        })
        .collect())
}

fn format_status_text(report: &StatusReport, opts: &FormatOptions) -> String {
    let health = match (&report.health_error, report.healthy) {
        (Some(e), _) => format!("unreachable ({e})"),
        (None, true) => "ok".to_string(),
        (None, false) => "unhealthy".to_string(),
    };
    let health = match (opts.no_color, report.healthy) {
        (true, _) => health,
        (false, true) => health.green().to_string(),
        (false, false) => health.red().to_string(),
    };

    let mut output = format!("Backend {}: {}", report.url, health);
    if let Some(time) = &report.server_time {
        output.push_str(&format!(" (server time {time})"));
    }
    output.push('\n');

    for device in &report.devices {
        match (&device.state, &device.error) {
            (Some(state), _) => output.push_str(&format_display(state, opts)),
            (None, Some(e)) => output.push_str(&format!("{}: {e}", device.device_id)),
            (None, None) => output.push_str(&format!("{}: no data", device.device_id)),
        }
        output.push('\n');
        if let Some(reading) = &device.reading {
            output.push_str("  ");
            output.push_str(&format_reading(&device.device_id, reading, opts));
            output.push('\n');
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatbeat_core::{Origin, SyncPhase};
    use time::macros::datetime;

    fn report(devices: Vec<DeviceStatus>) -> StatusReport {
        StatusReport {
            url: "http://localhost:8000".to_string(),
            healthy: true,
            server_time: None,
            health_error: None,
            devices,
        }
    }

    #[test]
    fn test_status_text_lists_devices() {
        let report = report(vec![
            DeviceStatus {
                device_id: "1".to_string(),
                state: Some(DisplayState {
                    device_id: "1".to_string(),
                    setpoint: 20.5,
                    origin: Origin::App,
                    saving: false,
                    notice: None,
                    phase: SyncPhase::Synced,
                    mode: None,
                    pending: None,
                }),
                reading: Some(Reading::new(19.5, datetime!(2026-01-10 07:00 UTC))),
                error: None,
            },
            DeviceStatus {
                device_id: "2".to_string(),
                state: None,
                reading: None,
                error: Some("Device not found: 2".to_string()),
            },
        ]);

        let text = format_status_text(&report, &FormatOptions::new(true));
        assert_eq!(
            text,
            "Backend http://localhost:8000: ok\n\
             1: 20.5°C (set in app)\n  \
             1: 19.5°C @ 2026-01-10T07:00:00Z\n\
             2: Device not found: 2\n"
        );
    }

    #[test]
    fn test_status_text_unreachable_backend() {
        let mut report = report(Vec::new());
        report.healthy = false;
        report.health_error = Some("Remote unavailable: connection refused".to_string());

        let text = format_status_text(&report, &FormatOptions::new(true));
        assert_eq!(
            text,
            "Backend http://localhost:8000: unreachable (Remote unavailable: connection refused)\n"
        );
    }

    #[test]
    fn test_status_json_skips_empty_fields() {
        let json = serde_json::to_value(report(Vec::new())).unwrap();
        assert_eq!(json["healthy"], true);
        assert!(json.get("server_time").is_none());
        assert_eq!(json["devices"], serde_json::json!([]));
    }
}
