//! Quality Gate
//!
//! Two pluggable checks run over generated artifacts before integration: a
//! dependency audit (import scan plus an optional external audit command)
//! and a test harness that synthesizes a smoke test per module and runs the
//! configured test command. Either check can be disabled at runtime; a
//! disabled check never blocks.
//!
//! An empty test session (pytest exit code 5 with "no tests ran") is benign
//! and does not block integration.

use crate::error::{Result, ResultExt};
use crate::generator::syntax;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Pytest's "collected 0 items" exit code
const PYTEST_NO_TESTS_RC: i32 = 5;

/// Modules the import scan refuses in generated code
const DENIED_IMPORTS: &[&str] = &["subprocess", "ctypes", "pickle", "marshal", "socket"];

/// Result of auditing one module's dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditOutcome {
    /// False when a denied import was found or the external audit failed
    pub success: bool,
    /// Top-level modules imported by the artifact
    pub imports: Vec<String>,
    /// Human-readable explanation
    pub detail: String,
}

/// Result of one test-harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    /// Whether the run counts as passing
    pub success: bool,
    /// Raw exit code, when the process ran at all
    pub returncode: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

/// Audits an artifact's dependencies
pub trait DependencyAuditor: Send + Sync {
    /// Inspect one module file
    fn audit(&self, module: &Path) -> Result<AuditOutcome>;
}

/// Runs tests against an artifact
pub trait TestHarness: Send + Sync {
    /// Exercise one module file
    fn run(&self, module: &Path) -> Result<TestRun>;
}

/// Import scan with an optional external audit command.
///
/// The scan itself is authoritative: a denied import fails the audit. The
/// external command (for example a vulnerability scanner) is best-effort —
/// a nonzero exit fails the audit, but a command that cannot be spawned is
/// logged and skipped.
#[derive(Debug)]
pub struct ImportScanAuditor {
    import_re: regex::Regex,
    external: Option<Vec<String>>,
}

impl ImportScanAuditor {
    /// Build the auditor; `external` is run as `cmd args.. <module>`
    pub fn new(external: Option<Vec<String>>) -> Self {
        Self {
            // matches both `import x.y` and `from x.y import z`
            import_re: regex::Regex::new(r"^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)")
                .expect("import regex is valid"),
            external,
        }
    }

    fn scan_imports(&self, source: &str) -> Vec<String> {
        let mut imports = Vec::new();
        for line in source.lines() {
            if let Some(caps) = self.import_re.captures(line) {
                let module = caps[1].split('.').next().unwrap_or(&caps[1]).to_string();
                if !imports.contains(&module) {
                    imports.push(module);
                }
            }
        }
        imports
    }
}

impl DependencyAuditor for ImportScanAuditor {
    fn audit(&self, module: &Path) -> Result<AuditOutcome> {
        let source = std::fs::read_to_string(module)
            .with_context(|| format!("reading {} for audit", module.display()))?;
        let imports = self.scan_imports(&source);

        let denied: Vec<&String> = imports
            .iter()
            .filter(|m| DENIED_IMPORTS.contains(&m.as_str()))
            .collect();
        if !denied.is_empty() {
            return Ok(AuditOutcome {
                success: false,
                detail: format!("denied imports: {denied:?}"),
                imports,
            });
        }

        if let Some(cmd) = &self.external {
            if let Some((program, args)) = cmd.split_first() {
                match Command::new(program).args(args).arg(module).output() {
                    Ok(out) if !out.status.success() => {
                        let detail = String::from_utf8_lossy(&out.stdout).into_owned();
                        return Ok(AuditOutcome {
                            success: false,
                            detail: format!("external audit failed: {detail}"),
                            imports,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(program, error = %e, "external audit command unavailable; skipping");
                    }
                }
            }
        }

        Ok(AuditOutcome {
            success: true,
            detail: format!("{} imports, none denied", imports.len()),
            imports,
        })
    }
}

/// Synthesizes a smoke test per artifact and runs the configured command.
///
/// For every discovered function callable with zero arguments a test is
/// generated that calls it and accepts any truthy or `None` result. Run
/// directories live under `runs_dir` and are keyed by timestamp and pid.
#[derive(Debug)]
pub struct PytestHarness {
    runs_dir: PathBuf,
    command: Vec<String>,
}

impl PytestHarness {
    /// Build a harness writing run dirs under `runs_dir`
    pub fn new(runs_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            command,
        }
    }

    /// Generate the smoke-test source for one module
    pub fn synthesize_test(module: &Path, source: &str) -> Result<String> {
        let functions = syntax::discover_functions(source)
            .map_err(crate::error::WardenError::ValidationFailed)?;
        let module_path = module.display();

        let mut test = format!(
            "import importlib.util\n\n\
             _spec = importlib.util.spec_from_file_location(\"candidate\", r\"{module_path}\")\n\
             _mod = importlib.util.module_from_spec(_spec)\n\
             _spec.loader.exec_module(_mod)\n\n\n\
             def test_module_loads():\n    assert _mod is not None\n"
        );
        for function in functions
            .iter()
            .filter(|f| f.required_params == 0 && !f.name.starts_with("test_"))
        {
            let name = &function.name;
            test.push_str(&format!(
                "\n\ndef test_calls_{name}():\n    \
                 result = _mod.{name}()\n    \
                 assert result is None or result\n"
            ));
        }
        Ok(test)
    }

    fn run_dir(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let dir = self.runs_dir.join(format!("{stamp}_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl TestHarness for PytestHarness {
    fn run(&self, module: &Path) -> Result<TestRun> {
        let source = std::fs::read_to_string(module)
            .with_context(|| format!("reading {} for testing", module.display()))?;
        let run_dir = self.run_dir()?;
        let test_path = run_dir.join("test_candidate.py");
        std::fs::write(&test_path, Self::synthesize_test(module, &source)?)?;

        let Some((program, args)) = self.command.split_first() else {
            return Ok(TestRun {
                success: false,
                returncode: None,
                output: "empty test command".to_string(),
            });
        };
        let output = Command::new(program)
            .args(args)
            .arg(&run_dir)
            .output()
            .with_context(|| format!("spawning test command {program}"))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let returncode = output.status.code();
        debug!(module = %module.display(), ?returncode, "test run finished");
        Ok(TestRun {
            success: output.status.success(),
            returncode,
            output: combined,
        })
    }
}

/// Stage at which a module failed the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    /// Dependency audit
    Audit,
    /// Test harness
    Tests,
}

/// One blocking failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFailure {
    /// The failing module
    pub module: PathBuf,
    /// Which check failed
    pub stage: GateStage,
    /// Explanation or captured output
    pub detail: String,
}

/// Overall verdict for a gate pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// True when any module produced a blocking failure
    pub blocked: bool,
    /// All blocking failures, in walk order
    pub failures: Vec<GateFailure>,
    /// Number of modules inspected
    pub checked: usize,
}

/// The gate itself: both checks, each independently toggleable
pub struct QualityGate {
    auditor: Box<dyn DependencyAuditor>,
    harness: Box<dyn TestHarness>,
    auditor_enabled: AtomicBool,
    harness_enabled: AtomicBool,
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGate")
            .field("auditor_enabled", &self.auditor_enabled)
            .field("harness_enabled", &self.harness_enabled)
            .finish()
    }
}

impl QualityGate {
    /// Build a gate with both checks enabled
    pub fn new(auditor: Box<dyn DependencyAuditor>, harness: Box<dyn TestHarness>) -> Self {
        Self {
            auditor,
            harness,
            auditor_enabled: AtomicBool::new(true),
            harness_enabled: AtomicBool::new(true),
        }
    }

    /// Toggle the dependency audit
    pub fn set_auditor_enabled(&self, enabled: bool) {
        self.auditor_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Toggle the test harness
    pub fn set_harness_enabled(&self, enabled: bool) {
        self.harness_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Gate one module
    pub fn check_module(&self, module: &Path) -> GateVerdict {
        let mut failures = Vec::new();
        self.check_into(module, &mut failures);
        GateVerdict {
            blocked: !failures.is_empty(),
            failures,
            checked: 1,
        }
    }

    /// Gate every `.py` artifact under `root`, including archived copies
    pub fn check_tree(&self, root: &Path) -> GateVerdict {
        let mut failures = Vec::new();
        let mut checked = 0;
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            checked += 1;
            self.check_into(path, &mut failures);
        }
        let verdict = GateVerdict {
            blocked: !failures.is_empty(),
            failures,
            checked,
        };
        info!(
            root = %root.display(),
            checked = verdict.checked,
            blocked = verdict.blocked,
            "quality gate pass complete"
        );
        verdict
    }

    fn check_into(&self, module: &Path, failures: &mut Vec<GateFailure>) {
        if self.auditor_enabled.load(Ordering::SeqCst) {
            match self.auditor.audit(module) {
                Ok(outcome) if !outcome.success => failures.push(GateFailure {
                    module: module.to_path_buf(),
                    stage: GateStage::Audit,
                    detail: outcome.detail,
                }),
                Ok(_) => {}
                Err(e) => failures.push(GateFailure {
                    module: module.to_path_buf(),
                    stage: GateStage::Audit,
                    detail: e.to_string(),
                }),
            }
        }

        if self.harness_enabled.load(Ordering::SeqCst) {
            match self.harness.run(module) {
                Ok(run) if !run.success => {
                    if is_empty_session(&run) {
                        debug!(module = %module.display(), "no tests collected; not blocking");
                    } else {
                        failures.push(GateFailure {
                            module: module.to_path_buf(),
                            stage: GateStage::Tests,
                            detail: format!(
                                "exit {:?}: {}",
                                run.returncode,
                                truncate(&run.output, 800)
                            ),
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => failures.push(GateFailure {
                    module: module.to_path_buf(),
                    stage: GateStage::Tests,
                    detail: e.to_string(),
                }),
            }
        }
    }
}

/// Pytest exiting with code 5 means it collected nothing to run
fn is_empty_session(run: &TestRun) -> bool {
    run.returncode == Some(PYTEST_NO_TESTS_RC) && run.output.contains("no tests ran")
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
