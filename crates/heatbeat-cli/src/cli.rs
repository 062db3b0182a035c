//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "heatbeat")]
#[command(author, version, about = "Observe and steer HeatBeat thermostats", long_about = None)]
pub struct Cli {
    /// Backend URL (overrides the config file)
    #[arg(long, global = true, env = "HEATBEAT_URL")]
    pub url: Option<String>,

    /// Bearer token (overrides the config file)
    #[arg(long, global = true, env = "HEATBEAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "HEATBEAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Follow thermostats and print every change until Ctrl-C
    Watch(WatchArgs),

    /// Set an absolute setpoint and wait for the backend to confirm it
    Set {
        /// Thermostat id
        device: String,

        /// Target temperature in °C
        #[arg(allow_negative_numbers = true, value_parser = parse_celsius)]
        value: f64,
    },

    /// Move the setpoint by a delta from the confirmed value
    Nudge {
        /// Thermostat id
        device: String,

        /// Change in °C, e.g. 0.5 or -1
        #[arg(allow_negative_numbers = true, value_parser = parse_celsius)]
        delta: f64,
    },

    /// Show backend health and the current state of configured thermostats
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List thermostats visible to this session
    Devices {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Parse a temperature, rejecting NaN and infinities.
fn parse_celsius(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("'{s}' is not a finite temperature"))
    }
}

/// Arguments for `watch`
#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Thermostat ids (defaults to the configured devices, then to all)
    pub devices: Vec<String>,

    /// Use a push connection per device instead of polling
    #[arg(long, conflicts_with = "interval")]
    pub push: bool,

    /// Polling interval in seconds
    #[arg(short, long)]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Print the configuration file contents
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch_with_push() {
        let cli = Cli::try_parse_from(["heatbeat", "watch", "1", "2", "--push"]).unwrap();
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.devices, vec!["1", "2"]);
                assert!(args.push);
                assert_eq!(args.interval, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_push_conflicts_with_interval() {
        let result = Cli::try_parse_from(["heatbeat", "watch", "--push", "--interval", "5"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_negative_nudge() {
        let cli = Cli::try_parse_from(["heatbeat", "nudge", "7", "-1.5"]).unwrap();
        match cli.command {
            Commands::Nudge { device, delta } => {
                assert_eq!(device, "7");
                assert_eq!(delta, -1.5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        for value in ["NaN", "inf", "-inf"] {
            let err = Cli::try_parse_from(["heatbeat", "set", "7", value]).unwrap_err();
            assert!(err.to_string().contains("not a finite temperature"), "{err}");
            assert!(Cli::try_parse_from(["heatbeat", "nudge", "7", value]).is_err());
        }
        assert!(Cli::try_parse_from(["heatbeat", "set", "7", "warm"]).is_err());
        assert_eq!(parse_celsius("21.5"), Ok(21.5));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "heatbeat",
            "devices",
            "--url",
            "http://hub.local:8000",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("http://hub.local:8000"));
        assert!(matches!(
            cli.command,
            Commands::Devices {
                format: OutputFormat::Json
            }
        ));
    }
}
