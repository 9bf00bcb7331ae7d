//! Request Ledger - the learning-request state machine and Black Vault
//!
//! Requests move `Pending -> {Approved, Denied}` and are retained forever
//! for audit. Descriptions denied "to the vault" are remembered by content
//! hash and can never be requested again, from any topic. The ledger is the
//! sole writer of both the request table and the vault.

use crate::error::Result;
use crate::notify::{ApprovalEvent, ApprovalListener, ApprovalNotifier};
use crate::store::KeyedStore;
use crate::telemetry::TelemetrySink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::warn;

/// Length of the truncated content-derived request id
const REQUEST_ID_LEN: usize = 12;

/// Lifecycle state of a request. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting review
    Pending,
    /// Approved; a response was recorded
    Approved,
    /// Denied; a reason was recorded
    Denied,
}

/// Review priority, ordered LOW < MEDIUM < HIGH
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    /// Lowest urgency
    Low,
    /// Default urgency
    Medium,
    /// Highest urgency
    High,
}

/// One learning/change request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Content-derived short id: sha256(created + topic), truncated
    pub id: String,
    /// What the request is about
    pub topic: String,
    /// The payload to be implemented
    pub description: String,
    /// Review priority
    pub priority: RequestPriority,
    /// Lifecycle state
    pub status: RequestStatus,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Set on approval
    pub response: Option<String>,
    /// Set on denial
    pub reason: Option<String>,
    /// Opaque tracing id assigned on approval
    pub correlation_id: Option<String>,
}

/// Read-side aggregate counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Requests still awaiting review
    pub pending: usize,
    /// Approved requests
    pub approved: usize,
    /// Denied requests
    pub denied: usize,
    /// Suppressed content hashes in the Black Vault
    pub vault_entries: usize,
}

/// Result of asking whether a description is already in flight or suppressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentStanding {
    /// A request with this description exists and is still pending
    pub pending: bool,
    /// The description's hash is in the Black Vault
    pub vaulted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    requests: BTreeMap<String, Request>,
    black_vault: BTreeSet<String>,
}

/// The request state machine, persisted through the keyed store
#[derive(Debug)]
pub struct RequestLedger {
    store: KeyedStore,
    path: PathBuf,
    state: Mutex<LedgerState>,
    notifier: ApprovalNotifier,
    telemetry: TelemetrySink,
}

/// SHA-256 fingerprint of a request description, hex-encoded
pub fn fingerprint(description: &str) -> String {
    hex::encode(Sha256::digest(description.as_bytes()))
}

impl RequestLedger {
    /// Open (or create) the ledger persisted at `path`
    pub fn open(
        store: KeyedStore,
        path: impl Into<PathBuf>,
        notifier: ApprovalNotifier,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let path = path.into();
        let state: LedgerState = store.read(&path)?.unwrap_or_default();
        Ok(Self {
            store,
            path,
            state: Mutex::new(state),
            notifier,
            telemetry,
        })
    }

    /// Register a listener for approval events
    pub async fn register_approval_listener(&self, listener: Arc<dyn ApprovalListener>) {
        self.notifier.register(listener).await;
    }

    /// Create a request. Returns `None` (no request recorded) when topic or
    /// description is empty, or when the description is vault-suppressed.
    pub fn create(
        &self,
        topic: &str,
        description: &str,
        priority: RequestPriority,
    ) -> Result<Option<String>> {
        if topic.is_empty() || description.is_empty() {
            warn!("create called with empty topic/description");
            return Ok(None);
        }

        let created = Utc::now();
        let content_hash = fingerprint(description);
        let id = {
            let seed = format!("{}{}", created.to_rfc3339(), topic);
            let digest = hex::encode(Sha256::digest(seed.as_bytes()));
            digest[..REQUEST_ID_LEN].to_string()
        };

        {
            let mut state = self.state.lock().expect("ledger poisoned");
            if state.black_vault.contains(&content_hash) {
                warn!(topic, "request blocked: content in black vault");
                return Ok(None);
            }
            state.requests.insert(
                id.clone(),
                Request {
                    id: id.clone(),
                    topic: topic.to_string(),
                    description: description.to_string(),
                    priority,
                    status: RequestStatus::Pending,
                    created,
                    response: None,
                    reason: None,
                    correlation_id: None,
                },
            );
            self.store.write(&self.path, &*state)?;
        }

        self.telemetry.emit(
            "learning_request_created",
            serde_json::json!({"id": id, "topic": topic}),
        );
        Ok(Some(id))
    }

    /// Approve a request and enqueue the notification fan-out.
    ///
    /// Returns `Ok(false)` when the id is unknown. Re-approving a terminal
    /// request is an idempotent overwrite of the same terminal fields.
    pub async fn approve(&self, id: &str, response: &str) -> Result<bool> {
        let event = {
            let mut state = self.state.lock().expect("ledger poisoned");
            let Some(request) = state.requests.get_mut(id) else {
                return Ok(false);
            };
            request.status = RequestStatus::Approved;
            request.response = Some(response.to_string());
            request.correlation_id = Some(uuid::Uuid::new_v4().simple().to_string());
            let snapshot = request.clone();
            self.store.write(&self.path, &*state)?;
            ApprovalEvent {
                request_id: id.to_string(),
                request: snapshot,
            }
        };

        // Queued, never synchronous: a slow or panicking listener cannot
        // delay this caller or corrupt ledger state.
        self.notifier.enqueue(event).await;
        self.telemetry.emit(
            "learning_request_approved",
            serde_json::json!({"id": id, "response": response}),
        );
        Ok(true)
    }

    /// Deny a request, optionally adding its description hash to the Black
    /// Vault. Returns `Ok(false)` when the id is unknown.
    pub fn deny(&self, id: &str, reason: &str, to_vault: bool) -> Result<bool> {
        {
            let mut state = self.state.lock().expect("ledger poisoned");
            let Some(request) = state.requests.get_mut(id) else {
                return Ok(false);
            };
            request.status = RequestStatus::Denied;
            request.reason = Some(reason.to_string());
            if to_vault {
                let hash = fingerprint(&request.description);
                state.black_vault.insert(hash);
            }
            self.store.write(&self.path, &*state)?;
        }

        self.telemetry.emit(
            "learning_request_denied",
            serde_json::json!({"id": id, "reason": reason}),
        );
        Ok(true)
    }

    /// Look up a request by id
    pub fn get(&self, id: &str) -> Option<Request> {
        let state = self.state.lock().expect("ledger poisoned");
        state.requests.get(id).cloned()
    }

    /// All requests still awaiting review
    pub fn get_pending(&self) -> Vec<Request> {
        let state = self.state.lock().expect("ledger poisoned");
        state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    /// Aggregate counters; pure read, no side effects
    pub fn get_statistics(&self) -> LedgerStats {
        let state = self.state.lock().expect("ledger poisoned");
        let mut stats = LedgerStats {
            pending: 0,
            approved: 0,
            denied: 0,
            vault_entries: state.black_vault.len(),
        };
        for request in state.requests.values() {
            match request.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Approved => stats.approved += 1,
                RequestStatus::Denied => stats.denied += 1,
            }
        }
        stats
    }

    /// Whether a description is currently pending review or vault-suppressed.
    /// Consulted by the generator to avoid duplicate-generation races while
    /// a human is still reviewing.
    pub fn content_standing(&self, description: &str) -> ContentStanding {
        let hash = fingerprint(description);
        let state = self.state.lock().expect("ledger poisoned");
        let pending = state
            .requests
            .values()
            .any(|r| r.status == RequestStatus::Pending && fingerprint(&r.description) == hash);
        ContentStanding {
            pending,
            vaulted: state.black_vault.contains(&hash),
        }
    }
}
