//! Staging area
//!
//! Generated artifacts wait here as timestamped records until a human with
//! the integrator role activates them. A staged record carries enough
//! context to integrate later without the original request: the artifact
//! path, the request id, topic, and description. Activation gates the
//! artifact, integrates it, and flips the record to `Activated` in place,
//! so the waiting room doubles as an activation history.

use crate::access::{AccessControl, ROLE_INTEGRATOR};
use crate::error::{Result, WardenError};
use crate::integration::{IntegrationReport, Integrator};
use crate::quality::{GateFailure, QualityGate};
use crate::store::KeyedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Lifecycle of a staged record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedState {
    /// Waiting for activation
    Staged,
    /// Activated and integrated
    Activated,
}

/// One record in the waiting room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedEntry {
    /// When the artifact was staged
    pub ts: DateTime<Utc>,
    /// Originating request
    pub request_id: String,
    /// Request topic
    pub topic: String,
    /// Request description
    pub description: String,
    /// The generated artifact this record points at
    pub artifact: PathBuf,
    /// Current lifecycle state
    pub state: StagedState,
}

/// Outcome of an activation attempt
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    /// Gate passed and the artifact was integrated
    Activated(IntegrationReport),
    /// Requester lacks the integrator role
    Unauthorized,
    /// The staged artifact no longer exists on disk
    MissingArtifact(PathBuf),
    /// The Quality Gate blocked the artifact
    Blocked(Vec<GateFailure>),
}

/// The waiting room for generated artifacts
#[derive(Debug)]
pub struct StagingArea {
    store: KeyedStore,
    staged_dir: PathBuf,
}

impl StagingArea {
    /// Open the waiting room under `data_dir`
    pub fn open(store: KeyedStore, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let staged_dir = data_dir.into().join("waiting_room");
        std::fs::create_dir_all(&staged_dir)?;
        Ok(Self { store, staged_dir })
    }

    /// Directory holding staged records
    pub fn staged_dir(&self) -> &Path {
        &self.staged_dir
    }

    /// Stage an artifact; returns the path of the new record
    pub fn stage(
        &self,
        request_id: &str,
        topic: &str,
        description: &str,
        artifact: &Path,
    ) -> Result<PathBuf> {
        let ts = Utc::now();
        let entry = StagedEntry {
            ts,
            request_id: request_id.to_string(),
            topic: topic.to_string(),
            description: description.to_string(),
            artifact: artifact.to_path_buf(),
            state: StagedState::Staged,
        };
        let name = format!(
            "{}_{}.json",
            ts.format("%Y%m%dT%H%M%S%3fZ"),
            crate::generator::safe_identifier(request_id)
        );
        let path = self.staged_dir.join(name);
        self.store.write(&path, &entry)?;
        info!(request_id, path = %path.display(), "artifact staged");
        Ok(path)
    }

    /// All readable records, oldest first. Corrupt records are skipped with
    /// a warning.
    pub fn list(&self) -> Result<Vec<(PathBuf, StagedEntry)>> {
        let mut records = Vec::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.staged_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            match self.store.read::<StagedEntry>(&path)? {
                Some(entry) => records.push((path, entry)),
                None => warn!(path = %path.display(), "unreadable staged record skipped"),
            }
        }
        Ok(records)
    }

    /// Activate one staged record: RBAC check, artifact presence check,
    /// gate check, integrate, then mark the record `Activated`.
    pub fn activate(
        &self,
        staged_path: &Path,
        requester: &str,
        access: &AccessControl,
        integrator: &Integrator,
        gate: &QualityGate,
    ) -> Result<ActivationOutcome> {
        if !access.has_role(requester, ROLE_INTEGRATOR) {
            warn!(requester, "activation refused: integrator role required");
            return Ok(ActivationOutcome::Unauthorized);
        }

        let mut entry: StagedEntry = self
            .store
            .read(staged_path)?
            .ok_or_else(|| WardenError::NotFound(staged_path.display().to_string()))?;

        if !entry.artifact.exists() {
            return Ok(ActivationOutcome::MissingArtifact(entry.artifact));
        }

        let verdict = gate.check_module(&entry.artifact);
        if verdict.blocked {
            return Ok(ActivationOutcome::Blocked(verdict.failures));
        }

        let report = integrator.integrate_artifact(&entry.artifact)?;
        entry.state = StagedState::Activated;
        self.store.write(staged_path, &entry)?;
        info!(
            requester,
            request_id = %entry.request_id,
            integrated = report.integrated.len(),
            "staged artifact activated"
        );
        Ok(ActivationOutcome::Activated(report))
    }
}
