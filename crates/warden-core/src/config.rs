//! Configuration for the Warden pipeline
//!
//! All tunables live in a single TOML-loadable struct. A missing config file
//! yields the defaults; a corrupt one is an explicit error so misconfiguration
//! does not silently degrade to defaults.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when the content-safety analyzer is unavailable or times out.
///
/// The reference behavior is fail-open (degrade to "safe"). This is an
/// explicit, documented policy choice rather than an inherited default;
/// deployments routing untrusted agents should use [`ConsultPolicy::FailClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsultPolicy {
    /// Treat unavailable/timeout as safe and deliver the message
    #[default]
    FailOpen,
    /// Treat unavailable/timeout as unsafe and refuse delivery
    FailClosed,
}

/// Top-level configuration for all Warden components
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Root directory for persisted state (ledger, roles, staging, audits)
    pub data_dir: PathBuf,
    /// Directory where generated artifacts are written
    pub generated_dir: PathBuf,
    /// Drop directory scanned by the autonomous ingestion loop
    pub drop_dir: PathBuf,
    /// Target files that integration appends references to
    pub target_files: Vec<PathBuf>,
    /// Module path prefix for integration reference lines
    pub import_prefix: String,
    /// Whether manual (human-triggered) project-wide integration is enabled
    pub allow_integration: bool,
    /// Bounded capacity of the approval notification queue
    pub notify_capacity: usize,
    /// Worker pool size for listener delivery
    pub notify_workers: usize,
    /// Lock acquisition timeout in milliseconds
    pub lock_timeout_ms: u64,
    /// Age after which a lock file is considered stale and reclaimable
    pub lock_stale_after_ms: u64,
    /// Autonomous ingestion polling interval in seconds
    pub autolearn_interval_secs: u64,
    /// Policy when the content-safety analyzer cannot be consulted
    pub consult_policy: ConsultPolicy,
    /// Timeout for a single content-safety consultation, in milliseconds
    pub consult_timeout_ms: u64,
    /// Whether best-effort telemetry events are recorded (opt-in)
    pub telemetry_enabled: bool,
    /// Command used to execute synthesized tests
    pub test_command: Vec<String>,
    /// Optional external dependency-audit command (best-effort)
    pub audit_command: Option<Vec<String>>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            generated_dir: PathBuf::from("generated"),
            drop_dir: PathBuf::from("data/autolearn"),
            target_files: vec![PathBuf::from("src/app/main.py")],
            import_prefix: "app.generated".to_string(),
            allow_integration: false,
            notify_capacity: 200,
            notify_workers: 4,
            lock_timeout_ms: 5_000,
            lock_stale_after_ms: 30_000,
            autolearn_interval_secs: 60,
            consult_policy: ConsultPolicy::FailOpen,
            consult_timeout_ms: 2_000,
            telemetry_enabled: false,
            test_command: vec!["pytest".to_string(), "-q".to_string()],
            audit_command: None,
        }
    }
}

impl WardenConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            crate::error::WardenError::ValidationFailed(format!(
                "invalid config {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(config)
    }
}
