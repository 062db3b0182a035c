//! Devices command implementation.

use anyhow::{Context, Result};
use heatbeat_core::{DeviceSummary, RemoteStateClient};
use owo_colors::OwoColorize;

use crate::cli::OutputFormat;
use crate::util::Session;

pub async fn cmd_devices(session: &Session, format: OutputFormat) -> Result<()> {
    let client = session.client()?;
    let devices = client
        .list_devices()
        .await
        .context("Failed to list thermostats")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        OutputFormat::Text => {
            if devices.is_empty() {
                if !session.quiet {
                    eprintln!("No thermostats found.");
                }
                return Ok(());
            }
            print!("{}", format_devices_text(&devices, session.opts.no_color));
        }
    }
    Ok(())
}

fn format_devices_text(devices: &[DeviceSummary], no_color: bool) -> String {
    let width = devices.iter().map(|d| d.id.len()).max().unwrap_or(0);
    let mut output = String::new();
    for device in devices {
        let id = format!("{:<width$}", device.id);
        let id = if no_color {
            id
        } else {
            id.cyan().to_string()
        };
        let name = device.name.as_deref().unwrap_or("-");
        output.push_str(&format!("{id}  {name}\n"));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_devices_aligns_ids() {
        let devices = vec![
            DeviceSummary {
                id: "1".to_string(),
                name: Some("Living room".to_string()),
            },
            DeviceSummary::new("12"),
        ];
        assert_eq!(
            format_devices_text(&devices, true),
            "1   Living room\n12  -\n"
        );
    }
}
