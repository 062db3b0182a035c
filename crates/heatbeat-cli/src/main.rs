//! `heatbeat`: observe and steer HeatBeat thermostats from the terminal.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `watch` | Follow thermostats and print every change |
//! | `set` | Set an absolute setpoint |
//! | `nudge` | Move the setpoint by a delta |
//! | `status` | Backend health and current state |
//! | `devices` | List thermostats |
//! | `config` | Inspect or create the config file |
//!
//! # Environment Variables
//!
//! - `HEATBEAT_URL`: Backend URL (overridden by `--url`)
//! - `HEATBEAT_TOKEN`: Bearer token (overridden by `--token`)
//! - `HEATBEAT_CONFIG`: Config file path (overridden by `--config`)
//! - `NO_COLOR`: Disable colored output when set

mod cli;
mod commands;
mod config;
mod format;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use commands::{Edit, cmd_config, cmd_devices, cmd_set, cmd_status, cmd_watch};
use config::{Config, default_config_path};
use format::FormatOptions;
use util::Session;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)?;

    if let Commands::Config { action } = cli.command {
        return cmd_config(action, &config, &config_path);
    }
    config.validate()?;

    let session = Session {
        url: config.resolve_url(cli.url),
        token: config.resolve_token(cli.token),
        opts: FormatOptions::new(cli.no_color),
        quiet: cli.quiet,
        config,
    };
    tracing::debug!(url = %session.url, "Using backend");

    match cli.command {
        Commands::Watch(args) => cmd_watch(&session, args).await,
        Commands::Set { device, value } => cmd_set(&session, &device, Edit::Absolute(value)).await,
        Commands::Nudge { device, delta } => cmd_set(&session, &device, Edit::Delta(delta)).await,
        Commands::Status { format } => cmd_status(&session, format).await,
        Commands::Devices { format } => cmd_devices(&session, format).await,
        Commands::Config { .. } => Ok(()),
    }
}
