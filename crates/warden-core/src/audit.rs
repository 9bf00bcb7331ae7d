//! Append-only audit trail
//!
//! Each subsystem keeps its own audit file: a JSON array of
//! `{ts, action, details}` entries that is never mutated or pruned by the
//! core. Writes go through the keyed store so a crash mid-append cannot
//! corrupt the trail. Audit failures are logged, never fatal.

use crate::store::KeyedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened
    pub ts: DateTime<Utc>,
    /// Short machine-checkable action tag
    pub action: String,
    /// Structured action details
    pub details: serde_json::Value,
}

/// Append-only audit log backed by a single JSON-array file
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: KeyedStore,
    path: PathBuf,
}

impl AuditLog {
    /// Create an audit log writing to `path`
    pub fn new(store: KeyedStore, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    /// Path of the underlying audit file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append an entry. Best-effort: failures are logged and swallowed so
    /// auditing can never take down the operation being audited.
    pub fn record(&self, action: &str, details: serde_json::Value) {
        let entry = AuditEntry {
            ts: Utc::now(),
            action: action.to_string(),
            details,
        };
        let mut entries = match self.store.read::<Vec<AuditEntry>>(&self.path) {
            Ok(existing) => existing.unwrap_or_default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "audit read failed; starting fresh");
                Vec::new()
            }
        };
        entries.push(entry);
        if let Err(e) = self.store.write(&self.path, &entries) {
            warn!(path = %self.path.display(), error = %e, "failed to append audit entry");
        }
    }

    /// Read back the full trail (empty when absent or unreadable)
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.store
            .read::<Vec<AuditEntry>>(&self.path)
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_accumulate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(KeyedStore::new(), dir.path().join("audit.json"));

        log.record("implemented", json!({"req_id": "abc"}));
        log.record("archived", json!({"path": "x.py"}));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "implemented");
        assert_eq!(entries[1].action, "archived");
        assert!(entries[0].ts <= entries[1].ts);
    }

    #[test]
    fn test_corrupt_trail_restarts_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, "not an array").unwrap();

        let log = AuditLog::new(KeyedStore::new(), &path);
        log.record("after_corruption", json!({}));
        assert_eq!(log.entries().len(), 1);
    }
}
