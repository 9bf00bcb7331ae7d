//! Artifact Generator
//!
//! Turns an approved request into a source artifact using a selectable style
//! template, with syntax validation and automatic style fallback. A
//! fingerprint-based seen-set plus a consultation of the Request Ledger
//! suppress duplicate generation while a request is still under review or
//! after its content has been vaulted.
//!
//! Artifacts are written to a generator-owned directory and archived into a
//! timestamped, topic-named subfolder so every attempt is preserved even if
//! a later one overwrites the live file.

mod styles;
pub mod syntax;

pub use styles::{callable_name, safe_identifier, CodingStyle};

use crate::access::{AccessControl, ROLE_EXPERT};
use crate::audit::AuditLog;
use crate::error::{Result, WardenError};
use crate::ledger::{fingerprint, RequestLedger};
use crate::store::KeyedStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Number of lines included in the returned preview
const PREVIEW_LINES: usize = 40;

/// A successfully generated artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Live artifact path inside the generator's output directory
    pub path: PathBuf,
    /// First lines of the generated source
    pub preview: String,
    /// Style that ultimately validated
    pub style: CodingStyle,
    /// Timestamped archive copy under the topic subfolder
    pub archived: PathBuf,
}

/// Outcome of an `implement_request` call. Suppressions and total
/// validation failure are expected outcomes, not errors.
#[derive(Debug, Clone)]
pub enum ImplementOutcome {
    /// Artifact generated, validated, written, and archived
    Implemented(GeneratedArtifact),
    /// Fingerprint was already seen by this generator; nothing written
    IgnoredSeen {
        /// The suppressing fingerprint
        fingerprint: String,
    },
    /// The ledger reports the content as pending review or vaulted
    IgnoredPendingOrVaulted,
    /// No style produced syntactically valid code
    ValidationFailed {
        /// Styles attempted, in order
        tried: Vec<CodingStyle>,
        /// Final validation error
        error: String,
    },
}

/// Outcome of a conservative auto-fix pass on one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    /// File was normalized; the original is at `backup`
    Fixed {
        /// Backup copy written before modification
        backup: PathBuf,
    },
    /// Fix produced identical content; nothing touched
    Unchanged,
    /// File extension not handled by the fixer
    Unsupported,
    /// Normalized content failed re-validation; file left untouched
    SyntaxRejected {
        /// The validation error
        error: String,
    },
}

/// Report of a repository-wide auto-fix walk
#[derive(Debug, Default, Clone)]
pub struct FixRepoReport {
    /// Files that were fixed or confirmed clean
    pub fixed: Vec<PathBuf>,
    /// Files the fixer could not process
    pub errors: Vec<(PathBuf, String)>,
}

/// Result of an audit export
#[derive(Debug, Clone)]
pub struct AuditExport {
    /// Destination of the exported trail
    pub out: PathBuf,
    /// SHA-256 of the exported file, for tamper evidence
    pub signature: String,
    /// Sidecar file holding the signature
    pub signature_path: PathBuf,
}

/// The artifact generator
pub struct ArtifactGenerator {
    generated_dir: PathBuf,
    data_dir: PathBuf,
    store: KeyedStore,
    audit: AuditLog,
    current_style: Mutex<CodingStyle>,
    seen: Mutex<BTreeSet<String>>,
    seen_path: PathBuf,
    ledger: Option<Arc<RequestLedger>>,
}

impl std::fmt::Debug for ArtifactGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactGenerator")
            .field("generated_dir", &self.generated_dir)
            .field("current_style", &self.current_style)
            .finish()
    }
}

impl ArtifactGenerator {
    /// Create a generator owning `generated_dir`, with its seen-set and
    /// audit trail under `data_dir`. The initial style is random.
    pub fn new(
        store: KeyedStore,
        data_dir: impl Into<PathBuf>,
        generated_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let generated_dir = generated_dir.into();
        std::fs::create_dir_all(&generated_dir)?;
        std::fs::create_dir_all(&data_dir)?;

        let seen_path = data_dir.join("generator_seen.json");
        let seen: BTreeSet<String> = store.read(&seen_path)?.unwrap_or_default();
        let audit = AuditLog::new(store.clone(), data_dir.join("generator_audit.json"));
        let style = CodingStyle::random();
        info!(generated_dir = %generated_dir.display(), style = %style, "artifact generator ready");

        Ok(Self {
            generated_dir,
            data_dir,
            store,
            audit,
            current_style: Mutex::new(style),
            seen: Mutex::new(seen),
            seen_path,
            ledger: None,
        })
    }

    /// Inject the ledger consulted for pending/vaulted suppression
    pub fn attach_ledger(&mut self, ledger: Arc<RequestLedger>) {
        self.ledger = Some(ledger);
    }

    /// The generator's output directory
    pub fn generated_dir(&self) -> &Path {
        &self.generated_dir
    }

    /// The generator's audit trail
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Available styles
    pub fn list_styles(&self) -> Vec<CodingStyle> {
        CodingStyle::ALL.to_vec()
    }

    /// Currently selected style
    pub fn current_style(&self) -> CodingStyle {
        *self.current_style.lock().expect("style poisoned")
    }

    /// Set the style; `None` re-picks at random. Returns the new style.
    pub fn set_style(&self, style: Option<CodingStyle>) -> CodingStyle {
        let chosen = style.unwrap_or_else(CodingStyle::random);
        *self.current_style.lock().expect("style poisoned") = chosen;
        self.audit.record("set_style", json!({"style": chosen.as_str()}));
        chosen
    }

    /// Generate, validate, write, and archive an artifact for a request.
    pub fn implement_request(
        &self,
        req_id: &str,
        topic: &str,
        description: &str,
        style: Option<CodingStyle>,
    ) -> Result<ImplementOutcome> {
        let mut chosen = style.unwrap_or_else(|| self.current_style());
        let fp = fingerprint(description);

        if self.seen.lock().expect("seen poisoned").contains(&fp) {
            self.audit
                .record("ignored_seen", json!({"req_id": req_id, "fingerprint": fp}));
            return Ok(ImplementOutcome::IgnoredSeen { fingerprint: fp });
        }

        if let Some(ledger) = &self.ledger {
            let standing = ledger.content_standing(description);
            if standing.pending || standing.vaulted {
                self.mark_seen(fp.clone());
                self.audit.record(
                    "ignored_pending_or_vaulted",
                    json!({"req_id": req_id, "fingerprint": fp}),
                );
                return Ok(ImplementOutcome::IgnoredPendingOrVaulted);
            }
        }

        let mut content = chosen.render(topic, description);
        let mut tried = vec![chosen];
        let mut validation = syntax::validate_python(&content);

        if let Err(ref first_error) = validation {
            warn!(style = %chosen, error = %first_error, "initial validation failed; trying fallbacks");
            self.audit.record(
                "implement_validation_failed",
                json!({"req_id": req_id, "style": chosen.as_str(), "error": first_error}),
            );
            for fallback in CodingStyle::ALL {
                if tried.contains(&fallback) {
                    continue;
                }
                tried.push(fallback);
                let candidate = fallback.render(topic, description);
                match syntax::validate_python(&candidate) {
                    Ok(()) => {
                        content = candidate;
                        chosen = fallback;
                        validation = Ok(());
                        info!(style = %fallback, "fallback style validated");
                        self.audit.record(
                            "implement_fallback",
                            json!({"req_id": req_id, "chosen_style": fallback.as_str()}),
                        );
                        break;
                    }
                    Err(_) => continue,
                }
            }
        }

        if let Err(final_error) = validation {
            error!(req_id, error = %final_error, "validation failed for all styles");
            let tried_tags: Vec<_> = tried.iter().map(|s| s.as_str()).collect();
            self.audit.record(
                "implement_failed",
                json!({"req_id": req_id, "tried_styles": tried_tags, "error": final_error}),
            );
            return Ok(ImplementOutcome::ValidationFailed {
                tried,
                error: final_error,
            });
        }

        let file_name = format!("{}.py", safe_identifier(&format!("{req_id}_{topic}")));
        let path = self.generated_dir.join(&file_name);
        if let Err(e) = std::fs::write(&path, &content) {
            self.audit.record(
                "implement_failed",
                json!({"req_id": req_id, "error": e.to_string(), "style": chosen.as_str()}),
            );
            return Err(e.into());
        }
        info!(path = %path.display(), style = %chosen, "implementation written");
        self.audit.record(
            "implemented",
            json!({"req_id": req_id, "path": path, "style": chosen.as_str()}),
        );

        // Archive every attempt; re-runs add new timestamped copies
        let archive_dir = self.generated_dir.join(safe_identifier(topic));
        std::fs::create_dir_all(&archive_dir)?;
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let archived = archive_dir.join(format!("{ts}_{file_name}"));
        std::fs::copy(&path, &archived)?;
        self.audit
            .record("archived_generated", json!({"req_id": req_id, "archived": archived}));
        self.mark_seen(fp);

        let preview = content
            .lines()
            .take(PREVIEW_LINES)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ImplementOutcome::Implemented(GeneratedArtifact {
            path,
            preview,
            style: chosen,
            archived,
        }))
    }

    fn mark_seen(&self, fp: String) {
        let mut seen = self.seen.lock().expect("seen poisoned");
        seen.insert(fp);
        if let Err(e) = self.store.write(&self.seen_path, &*seen) {
            warn!(error = %e, "failed to persist seen fingerprints");
        }
    }

    /// Conservative auto-fix: tab and trailing-whitespace normalization and
    /// trailing-newline enforcement, with re-validation before overwrite for
    /// code files. Always writes a `.bak` copy before modifying.
    pub fn auto_fix_file(&self, path: &Path) -> Result<FixOutcome> {
        if !path.exists() {
            return Err(WardenError::MissingArtifact(path.to_path_buf()));
        }
        let original = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let fixed = match extension {
            "py" => {
                let mut fixed = original
                    .replace('\t', "    ")
                    .lines()
                    .map(|l| l.trim_end())
                    .collect::<Vec<_>>()
                    .join("\n");
                if !fixed.ends_with('\n') {
                    fixed.push('\n');
                }
                if let Err(error) = syntax::validate_python(&fixed) {
                    return Ok(FixOutcome::SyntaxRejected { error });
                }
                fixed
            }
            "md" | "markdown" => {
                let normalized = original.replace("\r\n", "\n").replace('\r', "\n");
                let mut lines: Vec<String> = normalized.lines().map(|l| l.to_string()).collect();
                if lines.first().map(|l| !l.trim_start().starts_with('#')).unwrap_or(true) {
                    lines.insert(0, "# Document".to_string());
                }
                let mut fixed = lines.join("\n");
                if !fixed.ends_with('\n') {
                    fixed.push('\n');
                }
                fixed
            }
            _ => return Ok(FixOutcome::Unsupported),
        };

        if fixed == original {
            return Ok(FixOutcome::Unchanged);
        }

        let backup = backup_path(path);
        std::fs::copy(path, &backup)?;
        std::fs::write(path, fixed)?;
        self.audit
            .record("auto_fix", json!({"path": path, "backup": backup}));
        Ok(FixOutcome::Fixed { backup })
    }

    /// Walk a tree and auto-fix every supported file, skipping version
    /// control and virtualenv directories.
    pub fn fix_repo(&self, root: &Path) -> FixRepoReport {
        let mut report = FixRepoReport::default();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir()
                && matches!(name.as_ref(), ".git" | "venv" | "env" | ".venv"))
        });
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(extension, "py" | "md" | "markdown") {
                continue;
            }
            match self.auto_fix_file(path) {
                Ok(FixOutcome::Fixed { .. }) | Ok(FixOutcome::Unchanged) => {
                    report.fixed.push(path.to_path_buf());
                }
                Ok(FixOutcome::Unsupported) => {}
                Ok(FixOutcome::SyntaxRejected { error }) => {
                    report.errors.push((path.to_path_buf(), error));
                }
                Err(e) => report.errors.push((path.to_path_buf(), e.to_string())),
            }
        }
        self.audit.record(
            "fix_repo",
            json!({"root": root, "fixed": report.fixed.len(), "errors": report.errors.len()}),
        );
        report
    }

    /// Export the audit trail with a SHA-256 signature sidecar. Requires
    /// the `expert` role.
    pub fn export_audit(
        &self,
        requester: &str,
        access: &AccessControl,
        out: Option<PathBuf>,
    ) -> Result<AuditExport> {
        if !access.has_role(requester, ROLE_EXPERT) {
            return Err(WardenError::Unauthorized {
                user: requester.to_string(),
                role: ROLE_EXPERT.to_string(),
            });
        }
        let audit_path = self.audit.path();
        if !audit_path.exists() {
            return Err(WardenError::NotFound("no audit trail recorded".to_string()));
        }

        let exports_dir = self.data_dir.join("exports");
        std::fs::create_dir_all(&exports_dir)?;
        let out = out.unwrap_or_else(|| exports_dir.join("generator_audit_export.json"));
        std::fs::copy(audit_path, &out)?;

        let data = std::fs::read(&out)?;
        let signature = hex::encode(Sha256::digest(&data));
        let signature_path = {
            let mut os = out.as_os_str().to_os_string();
            os.push(".sig");
            PathBuf::from(os)
        };
        std::fs::write(&signature_path, &signature)?;
        self.audit.record(
            "export_audit",
            json!({"requester": requester, "out": out, "signature": signature_path}),
        );

        Ok(AuditExport {
            out,
            signature,
            signature_path,
        })
    }
}

/// Backup path used by auto-fix (`<file>.bak`)
pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}
