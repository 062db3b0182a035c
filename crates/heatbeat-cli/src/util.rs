//! Shared helpers for building the client and engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use heatbeat_core::{HttpStateClient, SyncConfig, SyncEngine};

use crate::config::Config;
use crate::format::FormatOptions;

/// Everything a command needs, resolved from flags, environment and file.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: Config,
    pub url: String,
    pub token: Option<String>,
    pub opts: FormatOptions,
    pub quiet: bool,
}

impl Session {
    /// HTTP client for the resolved backend.
    pub fn client(&self) -> Result<Arc<HttpStateClient>> {
        let client = HttpStateClient::new(&self.url, self.token.clone())
            .with_context(|| format!("Invalid backend URL: {}", self.url))?
            .with_keepalive(Duration::from_secs(self.config.sync.keepalive_secs));
        Ok(Arc::new(client))
    }

    /// Engine over `client` using `sync` settings.
    pub fn engine(&self, client: Arc<HttpStateClient>, sync: SyncConfig) -> Result<SyncEngine> {
        SyncEngine::new(client, sync).context("Invalid sync settings")
    }

    /// Devices from the arguments or the config file, falling back to every
    /// device the backend lists.
    pub async fn devices_or_discover(
        &self,
        engine: &SyncEngine,
        args: Vec<String>,
    ) -> Result<Vec<String>> {
        let devices = self.config.resolve_devices(args);
        if !devices.is_empty() {
            for id in &devices {
                engine.watch(id);
            }
            return Ok(devices);
        }

        let found = engine
            .discover()
            .await
            .context("Failed to list thermostats")?;
        if found.is_empty() {
            bail!("No thermostats found. Add some to the backend or name them on the command line");
        }
        Ok(found.into_iter().map(|d| d.id).collect())
    }
}
