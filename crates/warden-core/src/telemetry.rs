//! Opt-in, local-first telemetry
//!
//! Disabled by default. When enabled, events are appended to a local
//! JSON-array file through the atomic keyed store; the file is capped at a
//! fixed number of events (oldest dropped first). Emission is best-effort:
//! a sink failure never fails the operation that produced the event.

use crate::store::KeyedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Maximum retained events before rotation drops the oldest
const MAX_EVENTS: usize = 1_000;

/// A recorded telemetry event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event name, e.g. `learning_request_created`
    pub name: String,
    /// When it was emitted
    pub ts: DateTime<Utc>,
    /// Structured payload
    pub payload: serde_json::Value,
}

/// Best-effort local telemetry sink
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    enabled: bool,
    store: KeyedStore,
    path: PathBuf,
}

impl TelemetrySink {
    /// Create a sink. A disabled sink is a no-op.
    pub fn new(enabled: bool, store: KeyedStore, path: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            store,
            path: path.into(),
        }
    }

    /// A permanently disabled sink
    pub fn disabled() -> Self {
        Self::new(false, KeyedStore::new(), PathBuf::from("telemetry.json"))
    }

    /// Whether events are being recorded
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Emit an event, best-effort
    pub fn emit(&self, name: &str, payload: serde_json::Value) {
        if !self.enabled {
            return;
        }
        let mut events = self
            .store
            .read::<Vec<TelemetryEvent>>(&self.path)
            .ok()
            .flatten()
            .unwrap_or_default();
        events.push(TelemetryEvent {
            name: name.to_string(),
            ts: Utc::now(),
            payload,
        });
        if events.len() > MAX_EVENTS {
            let excess = events.len() - MAX_EVENTS;
            events.drain(..excess);
        }
        if let Err(e) = self.store.write(&self.path, &events) {
            debug!(error = %e, "telemetry emission failed (non-fatal)");
        }
    }
}
