//! Setpoint synchronization and command dispatch for HeatBeat thermostats.
//!
//! This crate keeps a locally displayed setpoint consistent with a remote
//! authoritative value that can also be changed at the thermostat itself.
//! It decides when a user's change goes upstream and when it is dropped in
//! favor of a newer change made at the device.
//!
//! # Features
//!
//! - **Reconciliation**: Per-device state machine with origin attribution
//!   (app or device) and stale-response rejection
//! - **Single-writer dispatch**: At most one outstanding write per device,
//!   last user intent wins
//! - **Polling or push**: Fixed-interval fetches or a WebSocket per device
//!   with keepalive, both cancellable
//! - **Telemetry cache**: Latest reading (or a short history) per device
//! - **Change notifications**: Broadcast events for presentation layers
//! - **Mock backend**: In-memory remote with failure and latency injection
//!
//! # Feature flags
//!
//! | Flag | Enables |
//! |------|---------|
//! | `http` (default) | [`HttpStateClient`] over `reqwest` |
//! | `push` (default) | WebSocket subscriptions over `tokio-tungstenite` |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use heatbeat_core::{HttpStateClient, SyncConfig, SyncEngine, SyncEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpStateClient::new("http://localhost:8000", Some("token".into()))?;
//!     let engine = SyncEngine::new(Arc::new(client), SyncConfig::default())?;
//!
//!     engine.discover().await?;
//!     engine.start_configured();
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let SyncEvent::StateChanged { display } = event {
//!             println!("{}: {:.1}°C", display.device_id, display.setpoint);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
#[cfg(feature = "http")]
pub mod http_client;
pub mod mock;
pub mod push;
pub mod reconciler;
pub mod scheduler;
pub mod telemetry;
pub mod traits;
pub mod util;

// Core exports
pub use config::{Delivery, SyncConfig, ValidationError, format_validation_errors};
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use engine::SyncEngine;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SyncEvent};
pub use mock::{MockRemote, MockRemoteBuilder};
pub use push::{PushEvent, Subscription, parse_push_message};
pub use reconciler::{
    DeviceState, DisplayState, FailureOutcome, Notice, OpTicket, ReconcileOutcome, Reconciler,
    SharedReconciler, SyncPhase, WriteOutcome, WriteTicket,
};
pub use scheduler::{DeliveryMode, SchedulerHandle};
pub use telemetry::TelemetryCache;
pub use traits::RemoteStateClient;

#[cfg(feature = "http")]
pub use http_client::{HealthResponse, HttpStateClient};

// Re-export from heatbeat-types
pub use heatbeat_types::{
    DeviceSummary, Origin, Reading, RemoteSetpoint, SetpointBounds, ThermostatMode,
};
