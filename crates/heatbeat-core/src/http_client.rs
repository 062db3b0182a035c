//! HTTP client for the thermostat backend REST API.
//!
//! [`HttpStateClient`] implements [`RemoteStateClient`] over the backend's
//! bearer-authenticated JSON endpoints. With the `push` feature it also opens
//! the per-thermostat WebSocket for [`RemoteStateClient::subscribe`].
//!
//! # Example
//!
//! ```no_run
//! use heatbeat_core::{HttpStateClient, RemoteStateClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpStateClient::new("http://localhost:8000", Some("token".into()))?;
//!
//! let state = client.fetch_state("1").await?;
//! println!("{}°C set by {}", state.setpoint, state.origin);
//!
//! let confirmed = client.write_setpoint("1", 21.5).await?;
//! assert_eq!(confirmed.setpoint, 21.5);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

use heatbeat_types::{DeviceSummary, Origin, Reading, RemoteSetpoint, ThermostatMode};

use crate::error::{Error, Result};
use crate::push::{PushEvent, Subscription};
use crate::traits::RemoteStateClient;
use crate::util::{normalize_base_url, parse_timestamp, parse_timestamp_or_now, websocket_base};

/// Request timeout applied to every call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keepalive for push connections.
pub const DEFAULT_PUSH_KEEPALIVE: Duration = Duration::from_secs(30);

// ==========================================================================
// Wire types
// ==========================================================================

/// Thermostat ids are integers on the backend; accept strings too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Int(i64),
    Str(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Int(id) => id.to_string(),
            WireId::Str(id) => id,
        }
    }
}

/// Settings as returned by `GET`/`PUT /thermostats/{id}/settings`.
#[derive(Debug, Clone, Deserialize)]
struct SettingsOut {
    target_temp_c: f64,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    last_source: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl SettingsOut {
    fn into_remote(self, device_id: &str) -> RemoteSetpoint {
        let mode = self.mode.as_deref().and_then(|m| match m.parse::<ThermostatMode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                debug!(device_id, "Ignoring thermostat mode: {e}");
                None
            }
        });
        RemoteSetpoint {
            setpoint: self.target_temp_c,
            origin: Origin::from_wire(self.last_source.as_deref()),
            confirmed_at: parse_timestamp_or_now(self.updated_at.as_deref()),
            mode,
        }
    }
}

/// Body of `PUT /thermostats/{id}/settings`.
#[derive(Debug, Clone, Serialize)]
struct SettingsIn {
    target_temp_c: f64,
    mode: ThermostatMode,
}

/// Entry of `GET /thermostats`.
#[derive(Debug, Clone, Deserialize)]
struct ThermostatOut {
    id: WireId,
    #[serde(default)]
    name: Option<String>,
}

/// Entry of `GET /thermostats/{id}/readings`.
#[derive(Debug, Clone, Deserialize)]
struct ReadingOut {
    temperature_c: f32,
    #[serde(default)]
    humidity_pct: Option<f32>,
    #[serde(default)]
    pressure_hpa: Option<f32>,
    #[serde(default)]
    window_open_detected: Option<bool>,
    created_at: String,
}

impl ReadingOut {
    fn into_reading(self) -> Result<Reading> {
        let observed_at = parse_timestamp(&self.created_at).ok_or_else(|| {
            Error::malformed(format!("reading timestamp {:?}", self.created_at))
        })?;
        Ok(Reading {
            temperature: self.temperature_c,
            humidity: self.humidity_pct,
            pressure: self.pressure_hpa,
            window_open: self.window_open_detected,
            observed_at,
        })
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub time: Option<String>,
}

impl HealthResponse {
    /// Whether the backend reports itself healthy.
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }

    /// Server clock, if reported in a known format.
    pub fn server_time(&self) -> Option<OffsetDateTime> {
        self.time.as_deref().and_then(parse_timestamp)
    }
}

// ==========================================================================
// Client
// ==========================================================================

/// [`RemoteStateClient`] for the thermostat backend.
#[derive(Debug)]
pub struct HttpStateClient {
    client: Client,
    base_url: String,
    push_base: String,
    token: Option<String>,
    keepalive: Duration,
    /// Last mode seen per device, echoed back on writes.
    modes: Mutex<HashMap<String, ThermostatMode>>,
}

impl HttpStateClient {
    /// Create a client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Backend root, e.g. `"http://localhost:8000"`
    /// * `token` - Bearer token, if the backend requires one
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::invalid_config(format!("HTTP client: {e}")))?;
        Self::with_client(base_url, token, client)
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(base_url: &str, token: Option<String>, client: Client) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let push_base = format!("{}/api/v1", websocket_base(&base_url));
        Ok(Self {
            client,
            base_url,
            push_base,
            token: token.filter(|t| !t.is_empty()),
            keepalive: DEFAULT_PUSH_KEEPALIVE,
            modes: Mutex::new(HashMap::new()),
        })
    }

    /// Set the keepalive period for push connections.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Override where push connections go (`ws://` or `wss://` root that
    /// contains `/ws/thermostats/{id}`).
    #[must_use]
    pub fn with_push_base(mut self, push_base: &str) -> Self {
        self.push_base = push_base.trim().trim_end_matches('/').to_string();
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL a push subscription for `device_id` connects to.
    pub fn push_url(&self, device_id: &str) -> String {
        format!("{}/ws/thermostats/{}", self.push_base, device_id)
    }

    /// Check backend health.
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/healthz", self.base_url);
        self.send(self.client.get(&url), &url).await
    }

    fn cached_mode(&self, device_id: &str) -> ThermostatMode {
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .copied()
            .unwrap_or_default()
    }

    fn remember_mode(&self, device_id: &str, remote: &RemoteSetpoint) {
        if let Some(mode) = remote.mode {
            self.modes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device_id.to_string(), mode);
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> Result<T> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(|e| {
            Error::unavailable(format!("{url} not reachable: {e}"))
        })?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("{url}: {e}")))
    }
}

/// Convert a non-success response into the error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| status.to_string());
    Err(map_status(status, message))
}

fn map_status(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized,
        StatusCode::NOT_FOUND => Error::DeviceNotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::rejected(message)
        }
        _ => Error::unavailable(format!("HTTP {}: {message}", status.as_u16())),
    }
}

#[async_trait]
impl RemoteStateClient for HttpStateClient {
    async fn fetch_state(&self, device_id: &str) -> Result<RemoteSetpoint> {
        let url = format!("{}/thermostats/{}/settings", self.base_url, device_id);
        let settings: SettingsOut = self.send(self.client.get(&url), &url).await?;
        let remote = settings.into_remote(device_id);
        self.remember_mode(device_id, &remote);
        Ok(remote)
    }

    async fn write_setpoint(&self, device_id: &str, value: f64) -> Result<RemoteSetpoint> {
        let url = format!("{}/thermostats/{}/settings", self.base_url, device_id);
        let body = SettingsIn {
            target_temp_c: value,
            mode: self.cached_mode(device_id),
        };
        debug!(device_id, value, mode = %body.mode, "PUT settings");
        let settings: SettingsOut = self.send(self.client.put(&url).json(&body), &url).await?;
        let remote = settings.into_remote(device_id);
        self.remember_mode(device_id, &remote);
        Ok(remote)
    }

    async fn fetch_latest_reading(&self, device_id: &str) -> Result<Option<Reading>> {
        Ok(self.fetch_readings(device_id, 1).await?.into_iter().next())
    }

    async fn fetch_readings(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let url = format!(
            "{}/thermostats/{}/readings?limit={}",
            self.base_url, device_id, limit
        );
        let rows: Vec<ReadingOut> = self.send(self.client.get(&url), &url).await?;
        rows.into_iter().map(ReadingOut::into_reading).collect()
    }

    async fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        let url = format!("{}/thermostats", self.base_url);
        let rows: Vec<ThermostatOut> = self.send(self.client.get(&url), &url).await?;
        Ok(rows
            .into_iter()
            .map(|row| DeviceSummary {
                id: row.id.into_string(),
                name: row.name,
            })
            .collect())
    }

    #[cfg(feature = "push")]
    async fn subscribe(
        &self,
        device_id: &str,
        sink: mpsc::Sender<PushEvent>,
    ) -> Result<Subscription> {
        crate::push::connect_websocket(
            self.push_url(device_id),
            self.token.clone(),
            device_id.to_string(),
            sink,
            self.keepalive,
        )
        .await
    }

    #[cfg(not(feature = "push"))]
    async fn subscribe(
        &self,
        _device_id: &str,
        _sink: mpsc::Sender<PushEvent>,
    ) -> Result<Subscription> {
        Err(Error::Unsupported("push subscriptions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = HttpStateClient::new("http://localhost:8000", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_client_normalizes_url() {
        let client = HttpStateClient::new("http://localhost:8000/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_client_invalid_url() {
        let result = HttpStateClient::new("localhost:8000", None);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_token_is_dropped() {
        let client = HttpStateClient::new("http://localhost:8000", Some(String::new())).unwrap();
        assert!(client.token.is_none());
    }

    #[test]
    fn test_push_url() {
        let client = HttpStateClient::new("https://heat.example.com", None).unwrap();
        assert_eq!(
            client.push_url("7"),
            "wss://heat.example.com/api/v1/ws/thermostats/7"
        );

        let client = client.with_push_base("ws://localhost:9000/api/v1/");
        assert_eq!(client.push_url("7"), "ws://localhost:9000/api/v1/ws/thermostats/7");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, "x".into()),
            Error::Unauthorized
        );
        assert_eq!(map_status(StatusCode::FORBIDDEN, "x".into()), Error::Unauthorized);
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, "Brak termostatu".into()),
            Error::DeviceNotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "bad mode".into()),
            Error::Rejected { .. }
        ));
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, "x".into()),
            Error::Rejected { .. }
        ));
        let err = map_status(StatusCode::BAD_GATEWAY, "upstream".into());
        assert!(err.is_transient());
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_settings_decoding() {
        let json = r#"{"target_temp_c": 21.5, "mode": "heat", "last_source": "device", "updated_at": "2025-01-01T12:00:00.123456"}"#;
        let settings: SettingsOut = serde_json::from_str(json).unwrap();
        let remote = settings.into_remote("1");
        assert_eq!(remote.setpoint, 21.5);
        assert_eq!(remote.origin, Origin::Device);
        assert_eq!(remote.mode, Some(ThermostatMode::Heat));
        assert_eq!(remote.confirmed_at.unix_timestamp(), 1735732800);
    }

    #[test]
    fn test_settings_decoding_lenient() {
        let json = r#"{"target_temp_c": 20.0, "mode": "eco", "last_source": null}"#;
        let remote = serde_json::from_str::<SettingsOut>(json)
            .unwrap()
            .into_remote("1");
        assert_eq!(remote.origin, Origin::Unknown);
        assert_eq!(remote.mode, None);
    }

    #[test]
    fn test_settings_body() {
        let body = SettingsIn {
            target_temp_c: 22.0,
            mode: ThermostatMode::Auto,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["target_temp_c"], 22.0);
        assert_eq!(json["mode"], "auto");
    }

    #[test]
    fn test_thermostat_list_decoding() {
        let json = r#"[{"id": 3, "name": "Salon", "settings": {"target_temp_c": 21.0}}, {"id": "hall"}]"#;
        let rows: Vec<ThermostatOut> = serde_json::from_str(json).unwrap();
        assert_eq!(rows[0].id.clone().into_string(), "3");
        assert_eq!(rows[0].name.as_deref(), Some("Salon"));
        assert_eq!(rows[1].id.clone().into_string(), "hall");
    }

    #[test]
    fn test_reading_decoding() {
        let json = r#"{"id": 9, "temperature_c": 20.25, "humidity_pct": 41.0, "pressure_hpa": null, "window_open_detected": true, "created_at": "2025-01-01T12:00:00"}"#;
        let reading = serde_json::from_str::<ReadingOut>(json)
            .unwrap()
            .into_reading()
            .unwrap();
        assert_eq!(reading.temperature, 20.25);
        assert_eq!(reading.humidity, Some(41.0));
        assert_eq!(reading.pressure, None);
        assert_eq!(reading.window_open, Some(true));

        let bad = r#"{"temperature_c": 20.0, "created_at": "yesterday"}"#;
        assert!(matches!(
            serde_json::from_str::<ReadingOut>(bad).unwrap().into_reading(),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_mode_cache_defaults_to_auto() {
        let client = HttpStateClient::new("http://localhost:8000", None).unwrap();
        assert_eq!(client.cached_mode("1"), ThermostatMode::Auto);
        let remote = RemoteSetpoint::new(20.0, Origin::App, OffsetDateTime::now_utc())
            .with_mode(ThermostatMode::Off);
        client.remember_mode("1", &remote);
        assert_eq!(client.cached_mode("1"), ThermostatMode::Off);
    }

    #[test]
    fn test_health_status() {
        let health: HealthResponse =
            serde_json::from_str(r#"{"status": "ok", "time": "2025-01-01T12:00:00"}"#).unwrap();
        assert!(health.is_ok());
        assert_eq!(health.server_time().unwrap().unix_timestamp(), 1735732800);
    }
}
