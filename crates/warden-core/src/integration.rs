//! Integration and rollback
//!
//! Integration is a reversible append: each target file gets a `.bak` copy
//! first, then one import reference line for the generated module. A target
//! already carrying the reference is skipped, so integration is idempotent.
//! Rollback restores every target byte-for-byte from its backup and removes
//! the backup.
//!
//! Two gated entry points wrap the raw operation: `integrate_across_project`
//! honours the manual enable switch plus RBAC, and `integrate_approved`
//! always consults the Quality Gate first.

use crate::access::{AccessControl, ROLE_INTEGRATOR, SYSTEM_USER};
use crate::audit::AuditLog;
use crate::error::{Result, ResultExt};
use crate::generator::backup_path;
use crate::quality::{GateFailure, QualityGate};
use crate::store::KeyedStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One target that received the reference line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratedEntry {
    /// The modified target file
    pub target: PathBuf,
    /// Module name that was referenced
    pub module: String,
    /// Backup written before modification
    pub backup: PathBuf,
}

/// One target that was left untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// The skipped target
    pub target: PathBuf,
    /// `target_missing` or `already_integrated`
    pub reason: String,
}

/// Full record of one integration pass; feeds `rollback`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationReport {
    /// Targets modified, with their backups
    pub integrated: Vec<IntegratedEntry>,
    /// Targets intentionally left alone
    pub skipped: Vec<SkippedEntry>,
    /// Per-target failures; never abort the whole pass
    pub errors: Vec<(PathBuf, String)>,
}

/// Result of undoing an integration pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Targets restored from backup
    pub restored: Vec<PathBuf>,
    /// Targets that could not be restored (for example a missing backup)
    pub errors: Vec<(PathBuf, String)>,
}

/// Outcome of a gated integration attempt
#[derive(Debug, Clone)]
pub enum IntegrationOutcome {
    /// Gate passed; targets were processed
    Integrated(IntegrationReport),
    /// Integration disabled or the caller lacks the integrator role
    NotAllowed,
    /// The Quality Gate blocked the pass
    Blocked(Vec<GateFailure>),
    /// No generated artifact exists yet
    NothingToIntegrate,
}

/// Applies generated modules to project targets
#[derive(Debug)]
pub struct Integrator {
    generated_dir: PathBuf,
    targets: Vec<PathBuf>,
    import_prefix: String,
    audit: AuditLog,
}

impl Integrator {
    /// Build an integrator over the given targets. `import_prefix` is the
    /// Python package path the reference line imports from.
    pub fn new(
        store: KeyedStore,
        data_dir: impl Into<PathBuf>,
        generated_dir: impl Into<PathBuf>,
        targets: Vec<PathBuf>,
        import_prefix: impl Into<String>,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            generated_dir: generated_dir.into(),
            targets,
            import_prefix: import_prefix.into(),
            audit: AuditLog::new(store, data_dir.join("integration_audit.json")),
        }
    }

    /// The integrator's audit trail
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn reference_line(&self, module: &str) -> String {
        format!("from {} import {}", self.import_prefix, module)
    }

    /// Newest generated `.py` artifact in the live output directory (archive
    /// subfolders are not candidates)
    pub fn latest_artifact(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.generated_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("py"))
            .max_by_key(|e| {
                e.metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            })
            .map(|e| e.path())
    }

    /// All live `.py` artifacts in the output directory, sorted by name
    pub fn live_artifacts(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.generated_dir) else {
            return Vec::new();
        };
        let mut artifacts: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("py"))
            .collect();
        artifacts.sort();
        artifacts
    }

    /// Integrate every live artifact into every configured target; one
    /// merged report for the whole pass.
    pub fn integrate(&self) -> Result<IntegrationReport> {
        let mut report = IntegrationReport::default();
        for artifact in self.live_artifacts() {
            let part = self.integrate_artifact(&artifact)?;
            report.integrated.extend(part.integrated);
            report.skipped.extend(part.skipped);
            report.errors.extend(part.errors);
        }
        Ok(report)
    }

    /// Append one module's reference line to every configured target,
    /// backing each one up first. Per-target problems are recorded, not
    /// fatal.
    pub fn integrate_artifact(&self, module_path: &Path) -> Result<IntegrationReport> {
        let module = module_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                crate::error::WardenError::ValidationFailed(format!(
                    "artifact has no module name: {}",
                    module_path.display()
                ))
            })?
            .to_string();
        let reference = self.reference_line(&module);

        let mut report = IntegrationReport::default();
        for target in &self.targets {
            if !target.exists() {
                report.skipped.push(SkippedEntry {
                    target: target.clone(),
                    reason: "target_missing".to_string(),
                });
                continue;
            }
            match self.integrate_one(target, &module, &reference) {
                Ok(Some(entry)) => report.integrated.push(entry),
                Ok(None) => report.skipped.push(SkippedEntry {
                    target: target.clone(),
                    reason: "already_integrated".to_string(),
                }),
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "integration target failed");
                    report.errors.push((target.clone(), e.to_string()));
                }
            }
        }

        info!(
            module,
            integrated = report.integrated.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "integration pass complete"
        );
        self.audit.record(
            "integrate",
            json!({
                "module": module,
                "integrated": report.integrated.len(),
                "skipped": report.skipped.len(),
                "errors": report.errors.len(),
            }),
        );
        Ok(report)
    }

    fn integrate_one(
        &self,
        target: &Path,
        module: &str,
        reference: &str,
    ) -> Result<Option<IntegratedEntry>> {
        let content = std::fs::read_to_string(target)
            .with_context(|| format!("reading target {}", target.display()))?;
        if content.lines().any(|l| l.trim() == reference) {
            return Ok(None);
        }

        // One backup per pass: the first artifact touching a target snapshots
        // its pre-integration content; later appends must not clobber it
        let backup = backup_path(target);
        if !backup.exists() {
            std::fs::copy(target, &backup)
                .with_context(|| format!("backing up {}", target.display()))?;
        }

        let mut updated = content;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("\n# integrated generated module\n");
        updated.push_str(reference);
        updated.push('\n');
        std::fs::write(target, updated)?;

        Ok(Some(IntegratedEntry {
            target: target.to_path_buf(),
            module: module.to_string(),
            backup,
        }))
    }

    /// Restore every integrated target from its backup and delete the
    /// backup. A missing backup is recorded as an error for that target.
    pub fn rollback(&self, report: &IntegrationReport) -> RollbackReport {
        let mut result = RollbackReport::default();
        let mut done: std::collections::HashSet<&Path> = std::collections::HashSet::new();
        for entry in &report.integrated {
            // A multi-artifact pass lists a target once per artifact but
            // shares one backup; restore each target once
            if !done.insert(entry.target.as_path()) {
                continue;
            }
            if !entry.backup.exists() {
                result
                    .errors
                    .push((entry.target.clone(), "backup_missing".to_string()));
                continue;
            }
            let restore = std::fs::copy(&entry.backup, &entry.target)
                .and_then(|_| std::fs::remove_file(&entry.backup));
            match restore {
                Ok(()) => result.restored.push(entry.target.clone()),
                Err(e) => result.errors.push((entry.target.clone(), e.to_string())),
            }
        }
        self.audit.record(
            "rollback",
            json!({"restored": result.restored.len(), "errors": result.errors.len()}),
        );
        result
    }

    /// Gate-checked integration of every live artifact. Always runs the
    /// Quality Gate over the whole generated tree first.
    pub fn integrate_approved(&self, gate: &QualityGate) -> Result<IntegrationOutcome> {
        let verdict = gate.check_tree(&self.generated_dir);
        if verdict.blocked {
            self.audit.record(
                "integration_blocked",
                json!({"failures": verdict.failures.len()}),
            );
            return Ok(IntegrationOutcome::Blocked(verdict.failures));
        }
        if self.live_artifacts().is_empty() {
            return Ok(IntegrationOutcome::NothingToIntegrate);
        }
        Ok(IntegrationOutcome::Integrated(self.integrate()?))
    }

    /// Project-wide integration: requires the manual enable switch AND the
    /// integrator role, then still passes through the gate.
    pub fn integrate_across_project(
        &self,
        allow_integration: bool,
        access: &AccessControl,
        gate: &QualityGate,
    ) -> Result<IntegrationOutcome> {
        if !allow_integration || !access.has_role(SYSTEM_USER, ROLE_INTEGRATOR) {
            self.audit.record(
                "integration_refused",
                json!({"allow_integration": allow_integration}),
            );
            return Ok(IntegrationOutcome::NotAllowed);
        }
        self.integrate_approved(gate)
    }
}
