//! Push delivery of telemetry and setpoint changes.
//!
//! A [`Subscription`] owns a background task that forwards [`PushEvent`]s into
//! an `mpsc` channel. It supports graceful shutdown via
//! [`Subscription::close`], and dropping it cancels the task as well, so a
//! subscription can never outlive its owner.
//!
//! The WebSocket transport (feature `push`) speaks the backend's
//! `/api/v1/ws/thermostats/{id}` protocol:
//!
//! ```text
//! {"type": "telemetry", "data": {"temperature_c": 21.3, "humidity_pct": 40.0, ...}}
//! {"type": "setpoint", "target_c": 22.0}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use heatbeat_types::{Origin, Reading, RemoteSetpoint};

use crate::error::{Error, Result};
use crate::util::parse_timestamp_or_now;

/// Events delivered by a push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PushEvent {
    /// New sensor sample.
    Telemetry { device_id: String, reading: Reading },
    /// The remote setpoint changed.
    SetpointChanged {
        device_id: String,
        setpoint: RemoteSetpoint,
    },
    /// The connection died; the subscription must be re-opened.
    Disconnected { device_id: String, reason: String },
}

impl PushEvent {
    /// Device this event concerns.
    pub fn device_id(&self) -> &str {
        match self {
            PushEvent::Telemetry { device_id, .. }
            | PushEvent::SetpointChanged { device_id, .. }
            | PushEvent::Disconnected { device_id, .. } => device_id,
        }
    }
}

/// Handle to an open push subscription.
///
/// Closing or dropping the handle cancels the background task.
#[derive(Debug)]
pub struct Subscription {
    device_id: String,
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a forwarding task that observes `cancel_token`.
    pub fn new(
        device_id: impl Into<String>,
        cancel_token: CancellationToken,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            cancel_token,
            handle,
        }
    }

    /// Device this subscription delivers events for.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the background task is still running and not cancelled.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished() && !self.cancel_token.is_cancelled()
    }

    /// Close the subscription.
    pub fn close(self) {
        self.cancel_token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    temperature_c: f32,
    #[serde(default)]
    humidity_pct: Option<f32>,
    #[serde(default)]
    pressure_hpa: Option<f32>,
    #[serde(default)]
    window_open_detected: Option<bool>,
    #[serde(default)]
    ts: Option<Value>,
}

/// Parse one text frame from the push channel.
///
/// Returns `Ok(None)` for message types this client does not handle.
pub fn parse_push_message(device_id: &str, text: &str) -> Result<Option<PushEvent>> {
    let message: Value = serde_json::from_str(text)?;
    let kind = message.get("type").and_then(Value::as_str);
    match kind {
        Some("telemetry") => {
            let data = message
                .get("data")
                .cloned()
                .ok_or_else(|| Error::malformed("telemetry message without data"))?;
            let payload: TelemetryPayload = serde_json::from_value(data)?;
            let observed_at = parse_timestamp_or_now(payload.ts.as_ref().and_then(Value::as_str));
            Ok(Some(PushEvent::Telemetry {
                device_id: device_id.to_string(),
                reading: Reading {
                    temperature: payload.temperature_c,
                    humidity: payload.humidity_pct,
                    pressure: payload.pressure_hpa,
                    window_open: payload.window_open_detected,
                    observed_at,
                },
            }))
        }
        Some("setpoint") => {
            let target = message
                .get("target_c")
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::malformed("setpoint message without numeric target_c"))?;
            let origin = Origin::from_wire(message.get("source").and_then(Value::as_str));
            let confirmed_at = parse_timestamp_or_now(message.get("ts").and_then(Value::as_str));
            Ok(Some(PushEvent::SetpointChanged {
                device_id: device_id.to_string(),
                setpoint: RemoteSetpoint::new(target, origin, confirmed_at),
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(feature = "push")]
pub(crate) use websocket::connect_websocket;

#[cfg(feature = "push")]
mod websocket {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio::time::{MissedTickBehavior, interval};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use super::{PushEvent, Subscription, parse_push_message};
    use crate::error::{Error, Result};

    fn map_ws_error(err: tungstenite::Error) -> Error {
        match err {
            tungstenite::Error::Http(response)
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                Error::Unauthorized
            }
            tungstenite::Error::Url(e) => Error::invalid_config(format!("push URL: {e}")),
            other => Error::unavailable(format!("push connection failed: {other}")),
        }
    }

    /// Open the WebSocket for one device and spawn its reader task.
    pub(crate) async fn connect_websocket(
        url: String,
        token: Option<String>,
        device_id: String,
        sink: mpsc::Sender<PushEvent>,
        keepalive: Duration,
    ) -> Result<Subscription> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::invalid_config(format!("invalid push URL {url}: {e}")))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::invalid_config("token contains invalid header characters"))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_ws_error)?;
        info!(device_id = %device_id, "Push connection established");

        let (mut write, mut read) = ws_stream.split();
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let task_device = device_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(keepalive);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            let reason = loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(device_id = %task_device, "Push subscription cancelled");
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = write.send(Message::Text("ping".into())).await {
                            break format!("keepalive failed: {e}");
                        }
                    }
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match parse_push_message(&task_device, text.as_str()) {
                                Ok(Some(event)) => {
                                    if sink.send(event).await.is_err() {
                                        debug!("Push receiver dropped, stopping");
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!(device_id = %task_device, "Ignoring push frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            };

            warn!(device_id = %task_device, "Push connection lost: {reason}");
            let _ = sink
                .send(PushEvent::Disconnected {
                    device_id: task_device,
                    reason,
                })
                .await;
        });

        Ok(Subscription::new(device_id, cancel_token, handle))
    }
}
