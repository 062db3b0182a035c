//! Output formatting for thermostat state and change events.

use heatbeat_core::{DisplayState, Origin, Reading, SyncEvent, SyncPhase};
use owo_colors::OwoColorize;
use time::format_description::well_known::Rfc3339;

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool) -> Self {
        Self { no_color }
    }

    fn paint(&self, text: String, color: fn(&String) -> String) -> String {
        if self.no_color { text } else { color(&text) }
    }

    fn device(&self, id: &str) -> String {
        self.paint(id.to_string(), |s| s.cyan().to_string())
    }

    fn warning(&self, text: String) -> String {
        self.paint(text, |s| s.yellow().to_string())
    }

    fn error(&self, text: String) -> String {
        self.paint(text, |s| s.red().to_string())
    }

    fn dim(&self, text: String) -> String {
        self.paint(text, |s| s.dimmed().to_string())
    }
}

fn origin_label(origin: Origin) -> &'static str {
    match origin {
        Origin::App => "set in app",
        Origin::Device => "set at device",
        Origin::Unknown => "source unknown",
    }
}

/// One line describing what to show for a thermostat.
pub fn format_display(display: &DisplayState, opts: &FormatOptions) -> String {
    let mut line = format!(
        "{}: {:.1}°C ({})",
        opts.device(&display.device_id),
        display.setpoint,
        origin_label(display.origin)
    );
    if let Some(mode) = display.mode {
        line.push_str(&format!(" [{mode}]"));
    }
    match display.phase {
        SyncPhase::Synced => {}
        SyncPhase::Dispatching => line.push_str(&opts.dim(" saving...".to_string())),
        SyncPhase::Editing => line.push_str(&opts.dim(" pending".to_string())),
        SyncPhase::Conflicted => line.push_str(&opts.warning(" not saved".to_string())),
    }
    if let Some(notice) = &display.notice {
        line.push_str(&format!("\n  {}", opts.warning(notice.clone())));
    }
    line
}

/// One line for a telemetry sample.
pub fn format_reading(device_id: &str, reading: &Reading, opts: &FormatOptions) -> String {
    let at = reading
        .observed_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| reading.observed_at.to_string());
    format!(
        "{}: {} {}",
        opts.device(device_id),
        reading,
        opts.dim(format!("@ {at}"))
    )
}

/// Render a change event for `watch`. Returns `None` for events not shown.
pub fn format_event(event: &SyncEvent, opts: &FormatOptions) -> Option<String> {
    let line = match event {
        SyncEvent::DeviceAdded { device_id } => opts.dim(format!("watching {device_id}")),
        SyncEvent::DeviceRemoved { .. } => return None,
        SyncEvent::StateChanged { display } => format_display(display, opts),
        SyncEvent::TelemetryUpdated { device_id, reading } => format_reading(device_id, reading, opts),
        SyncEvent::WriteFailed { device_id, error } => format!(
            "{}: {}",
            opts.device(device_id),
            opts.error(format!("write failed: {error}"))
        ),
        SyncEvent::ConnectionDegraded {
            device_id,
            failures,
        } => format!(
            "{}: {}",
            opts.device(device_id),
            opts.warning(format!("{failures} updates failed in a row"))
        ),
        SyncEvent::PushDisconnected { device_id, reason } => format!(
            "{}: {}",
            opts.device(device_id),
            opts.warning(format!("push connection lost ({reason}), reconnecting"))
        ),
        SyncEvent::SessionExpired => opts.error("session expired, log in again".to_string()),
        _ => return None,
    };
    Some(line)
}
