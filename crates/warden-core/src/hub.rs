//! Orchestrator hub
//!
//! The hub owns the agent registry and every message that crosses it. A
//! message is routed only after the safety analyzer consents; when the
//! analyzer is slow or unavailable the configured consult policy decides
//! between fail-open delivery and fail-closed refusal. A global kill switch
//! cuts all communication at once.
//!
//! The hub also runs the autonomous loop: a cooperative background task
//! that drains a drop directory of instruction files, feeds them to the
//! absorber, and triggers quality-gate passes for implementation topics.

use crate::audit::AuditLog;
use crate::config::ConsultPolicy;
use crate::error::Result;
use crate::generator::safe_identifier;
use crate::quality::QualityGate;
use crate::store::KeyedStore;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Registry alias for the project head agent
pub const PROJECT_HEAD_ALIAS: &str = "PA";

/// Registry name whose enable state also drives the gate's dependency audit
pub const AUDITOR_AGENT: &str = "dependency_auditor";

/// Registry name whose enable state also drives the gate's test harness
pub const QA_AGENT: &str = "test_harness";

/// An agent reachable through the hub
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Deliver one message; the returned string is the agent's reply
    async fn receive_message(&self, from: &str, content: &str) -> Result<String>;

    /// Called when the agent is unregistered
    async fn deactivate(&self) {}
}

/// Safety verdict for one message
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    /// Whether delivery may proceed
    pub is_safe: bool,
    /// Analyzer explanation
    pub details: String,
}

/// Consulted before every delivery
#[async_trait]
pub trait SafetyAnalyzer: Send + Sync {
    /// Judge one message
    async fn analyze(&self, from: &str, to: &str, content: &str) -> SafetyVerdict;
}

/// Summary of one absorbed instruction file
#[derive(Debug, Clone)]
pub struct AbsorbReport {
    /// Facts or directives extracted
    pub facts: Vec<String>,
}

/// Consumes instruction files found by the autonomous loop
#[async_trait]
pub trait Absorber: Send + Sync {
    /// Digest one instruction file
    async fn absorb(&self, path: &Path, content: &str) -> Result<AbsorbReport>;
}

/// Result of a routing attempt
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Message delivered; the agent's reply
    Delivered(String),
    /// Refused before delivery (`communication_cut`, `agent_disabled`,
    /// `unsafe`, `safety_unavailable`)
    Refused {
        /// Machine-checkable refusal reason
        reason: String,
    },
    /// No agent registered under that name
    UnknownRecipient,
    /// The agent itself errored
    Failed(String),
}

struct AgentSlot {
    handle: Arc<dyn AgentHandle>,
    enabled: bool,
}

/// The orchestrator
pub struct Hub {
    agents: RwLock<HashMap<String, AgentSlot>>,
    project_head: RwLock<Option<String>>,
    analyzer: Option<Arc<dyn SafetyAnalyzer>>,
    absorber: Option<Arc<dyn Absorber>>,
    consult_policy: ConsultPolicy,
    consult_timeout: Duration,
    drop_dir: PathBuf,
    generated_dir: PathBuf,
    gate: Option<Arc<QualityGate>>,
    audit: AuditLog,
    comms_cut: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("drop_dir", &self.drop_dir)
            .field("consult_policy", &self.consult_policy)
            .finish()
    }
}

impl Hub {
    /// Build a hub. `drop_dir` is created if absent.
    pub fn new(
        store: KeyedStore,
        data_dir: impl Into<PathBuf>,
        drop_dir: impl Into<PathBuf>,
        generated_dir: impl Into<PathBuf>,
        consult_policy: ConsultPolicy,
        consult_timeout: Duration,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let drop_dir = drop_dir.into();
        std::fs::create_dir_all(&drop_dir)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            agents: RwLock::new(HashMap::new()),
            project_head: RwLock::new(None),
            analyzer: None,
            absorber: None,
            consult_policy,
            consult_timeout,
            drop_dir,
            generated_dir: generated_dir.into(),
            gate: None,
            audit: AuditLog::new(store, data_dir.join("hub_audit.json")),
            comms_cut: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        })
    }

    /// Attach the safety analyzer consulted before deliveries
    pub fn with_analyzer(mut self, analyzer: Arc<dyn SafetyAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Attach the absorber used by the autonomous loop
    pub fn with_absorber(mut self, absorber: Arc<dyn Absorber>) -> Self {
        self.absorber = Some(absorber);
        self
    }

    /// Attach the quality gate triggered for implementation topics
    pub fn with_gate(mut self, gate: Arc<QualityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Register an agent under `name`, enabled
    pub async fn register_agent(&self, name: &str, handle: Arc<dyn AgentHandle>) {
        self.agents.write().await.insert(
            name.to_string(),
            AgentSlot {
                handle,
                enabled: true,
            },
        );
        self.audit.record("agent_registered", json!({"name": name}));
    }

    /// Register the project head; reachable by name or the `PA` alias
    pub async fn register_project_head(&self, name: &str, handle: Arc<dyn AgentHandle>) {
        self.register_agent(name, handle).await;
        *self.project_head.write().await = Some(name.to_string());
        info!(name, "project head registered");
    }

    /// Remove an agent, calling its deactivation hook
    pub async fn unregister_agent(&self, name: &str) -> bool {
        let removed = self.agents.write().await.remove(name);
        match removed {
            Some(slot) => {
                slot.handle.deactivate().await;
                let mut head = self.project_head.write().await;
                if head.as_deref() == Some(name) {
                    *head = None;
                }
                self.audit.record("agent_unregistered", json!({"name": name}));
                true
            }
            None => false,
        }
    }

    /// Enable or disable an agent without unregistering it. Toggling the
    /// well-known auditor or QA agents also toggles the matching gate check.
    pub async fn set_agent_enabled(&self, name: &str, enabled: bool) -> bool {
        let toggled = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(name) {
                Some(slot) => {
                    slot.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if !toggled {
            return false;
        }
        if let Some(gate) = &self.gate {
            match name {
                AUDITOR_AGENT => gate.set_auditor_enabled(enabled),
                QA_AGENT => gate.set_harness_enabled(enabled),
                _ => {}
            }
        }
        self.audit
            .record("agent_toggled", json!({"name": name, "enabled": enabled}));
        true
    }

    /// Whether an agent exists and is enabled
    pub async fn is_agent_enabled(&self, name: &str) -> bool {
        self.agents
            .read()
            .await
            .get(name)
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    /// All registered agents with their enabled flags, sorted by name
    pub async fn list_agents(&self) -> Vec<(String, bool)> {
        let agents = self.agents.read().await;
        let mut listing: Vec<_> = agents
            .iter()
            .map(|(name, slot)| (name.clone(), slot.enabled))
            .collect();
        listing.sort();
        listing
    }

    /// Cut all communication immediately
    pub fn cut_communication(&self) {
        self.comms_cut.store(true, Ordering::SeqCst);
        self.audit.record("communication_cut", json!({}));
        warn!("hub communication cut");
    }

    /// Restore communication after a cut
    pub fn restore_communication(&self) {
        self.comms_cut.store(false, Ordering::SeqCst);
        self.audit.record("communication_restored", json!({}));
    }

    /// Set an agent inactive and invoke its deactivation hook. No-op for
    /// principals outside the registry.
    async fn sever_agent(&self, name: &str) {
        let handle = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(name) {
                Some(slot) => {
                    slot.enabled = false;
                    Some(Arc::clone(&slot.handle))
                }
                None => None,
            }
        };
        if let Some(handle) = handle {
            handle.deactivate().await;
            warn!(name, "agent severed after unsafe verdict");
            self.audit.record("agent_severed", json!({"name": name}));
        }
    }

    async fn resolve(&self, to: &str) -> Option<String> {
        if to == PROJECT_HEAD_ALIAS {
            return self.project_head.read().await.clone();
        }
        Some(to.to_string())
    }

    /// Route one message through the safety consult to its recipient
    pub async fn route_message(&self, from: &str, to: &str, content: &str) -> DeliveryOutcome {
        if self.comms_cut.load(Ordering::SeqCst) {
            return DeliveryOutcome::Refused {
                reason: "communication_cut".to_string(),
            };
        }

        // The consult precedes any recipient lookup: an unsafe sender is
        // severed even when it addresses an unknown or disabled name
        if let Some(analyzer) = &self.analyzer {
            let consult =
                tokio::time::timeout(self.consult_timeout, analyzer.analyze(from, to, content))
                    .await;
            match consult {
                Ok(verdict) if !verdict.is_safe => {
                    // The sender loses its voice, not just this message
                    self.sever_agent(from).await;
                    self.audit.record(
                        "message_refused",
                        json!({"from": from, "to": to, "details": verdict.details}),
                    );
                    return DeliveryOutcome::Refused {
                        reason: "unsafe".to_string(),
                    };
                }
                Ok(_) => {}
                Err(_) => match self.consult_policy {
                    ConsultPolicy::FailOpen => {
                        warn!(from, to, "safety consult timed out; delivering (fail-open)");
                    }
                    ConsultPolicy::FailClosed => {
                        warn!(from, to, "safety consult timed out; refusing (fail-closed)");
                        return DeliveryOutcome::Refused {
                            reason: "safety_unavailable".to_string(),
                        };
                    }
                },
            }
        }

        let Some(recipient) = self.resolve(to).await else {
            return DeliveryOutcome::UnknownRecipient;
        };

        let handle = {
            let agents = self.agents.read().await;
            match agents.get(&recipient) {
                None => return DeliveryOutcome::UnknownRecipient,
                Some(slot) if !slot.enabled => {
                    return DeliveryOutcome::Refused {
                        reason: "agent_disabled".to_string(),
                    }
                }
                Some(slot) => Arc::clone(&slot.handle),
            }
        };

        match handle.receive_message(from, content).await {
            Ok(reply) => {
                debug!(from, to = %recipient, "message delivered");
                DeliveryOutcome::Delivered(reply)
            }
            Err(e) => {
                error!(from, to = %recipient, error = %e, "agent failed to handle message");
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    /// Spawn the autonomous loop; returns its join handle. Runs until
    /// `stop` is called.
    pub fn run_autonomous(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(drop_dir = %hub.drop_dir.display(), "autonomous loop started");
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = hub.drain_drop_dir().await {
                            // one bad cycle never stops the loop
                            error!(error = %e, "autonomous cycle failed");
                        }
                    }
                }
            }
            info!("autonomous loop stopped");
        })
    }

    /// Signal the autonomous loop to exit; it stops within one interval
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn drain_drop_dir(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.drop_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("txt"))
            .collect();
        files.sort();

        for path in files {
            if let Err(e) = self.consume_instruction(&path).await {
                error!(path = %path.display(), error = %e, "instruction file failed");
            }
        }
        Ok(())
    }

    async fn consume_instruction(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let topic = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        info!(topic, path = %path.display(), "consuming instruction file");

        if let Some(absorber) = &self.absorber {
            let report = absorber.absorb(path, &content).await?;
            self.audit.record(
                "instruction_absorbed",
                json!({"topic": topic, "facts": report.facts.len()}),
            );
        }

        // Consume exactly once: the rename marks the file as processed even
        // if a later step fails.
        let mut consumed = path.as_os_str().to_os_string();
        consumed.push(".consumed");
        std::fs::rename(path, PathBuf::from(consumed))?;

        if topic.starts_with("code") || topic.starts_with("impl") {
            if let Some(gate) = &self.gate {
                // Only the most recent artifact for the topic is checked;
                // older archive entries already had their pass
                let topic_dir = self.generated_dir.join(safe_identifier(&topic));
                if let Some(newest) = newest_artifact(&topic_dir) {
                    let verdict = gate.check_module(&newest);
                    self.audit.record(
                        "autonomous_gate_pass",
                        json!({
                            "topic": topic,
                            "module": newest.display().to_string(),
                            "blocked": verdict.blocked,
                        }),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Newest `.py` file in `dir` by name; archive names sort chronologically
fn newest_artifact(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("py"))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl AgentHandle for Echo {
        async fn receive_message(&self, from: &str, content: &str) -> Result<String> {
            Ok(format!("{from}:{content}"))
        }
    }

    struct FixedAnalyzer {
        safe: bool,
    }

    #[async_trait]
    impl SafetyAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _from: &str, _to: &str, _content: &str) -> SafetyVerdict {
            SafetyVerdict {
                is_safe: self.safe,
                details: "fixed".to_string(),
            }
        }
    }

    struct StalledAnalyzer;

    #[async_trait]
    impl SafetyAnalyzer for StalledAnalyzer {
        async fn analyze(&self, _from: &str, _to: &str, _content: &str) -> SafetyVerdict {
            tokio::time::sleep(Duration::from_secs(60)).await;
            SafetyVerdict {
                is_safe: true,
                details: "late".to_string(),
            }
        }
    }

    struct CountingAbsorber {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Absorber for CountingAbsorber {
        async fn absorb(&self, _path: &Path, content: &str) -> Result<AbsorbReport> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(AbsorbReport {
                facts: content.lines().map(|l| l.to_string()).collect(),
            })
        }
    }

    fn hub_in(dir: &Path, policy: ConsultPolicy) -> Hub {
        Hub::new(
            KeyedStore::new(),
            dir.join("data"),
            dir.join("drop"),
            dir.join("generated"),
            policy,
            Duration::from_millis(100),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_route_to_registered_agent() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        hub.register_agent("coder", Arc::new(Echo)).await;

        let outcome = hub.route_message("ceo", "coder", "hello").await;
        let DeliveryOutcome::Delivered(reply) = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(reply, "ceo:hello");
    }

    #[tokio::test]
    async fn test_project_head_alias() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        hub.register_project_head("athena", Arc::new(Echo)).await;

        let outcome = hub.route_message("ceo", PROJECT_HEAD_ALIAS, "status").await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered(_)));

        // alias dies with the head
        hub.unregister_agent("athena").await;
        let outcome = hub.route_message("ceo", PROJECT_HEAD_ALIAS, "status").await;
        assert!(matches!(outcome, DeliveryOutcome::UnknownRecipient));
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        let outcome = hub.route_message("ceo", "nobody", "hi").await;
        assert!(matches!(outcome, DeliveryOutcome::UnknownRecipient));
    }

    #[tokio::test]
    async fn test_disabled_agent_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        hub.register_agent("coder", Arc::new(Echo)).await;
        assert!(hub.set_agent_enabled("coder", false).await);
        assert!(!hub.is_agent_enabled("coder").await);

        let outcome = hub.route_message("ceo", "coder", "hi").await;
        let DeliveryOutcome::Refused { reason } = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(reason, "agent_disabled");

        assert!(hub.set_agent_enabled("coder", true).await);
        assert!(matches!(
            hub.route_message("ceo", "coder", "hi").await,
            DeliveryOutcome::Delivered(_)
        ));
    }

    #[tokio::test]
    async fn test_unsafe_message_is_refused_and_sender_severed() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen)
            .with_analyzer(Arc::new(FixedAnalyzer { safe: false }));
        hub.register_agent("coder", Arc::new(Echo)).await;
        hub.register_agent("rogue", Arc::new(Echo)).await;

        let outcome = hub.route_message("rogue", "coder", "rm -rf /").await;
        let DeliveryOutcome::Refused { reason } = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(reason, "unsafe");

        // the sender lost its registry slot's enabled flag
        assert!(!hub.is_agent_enabled("rogue").await);
        assert!(hub.is_agent_enabled("coder").await);
    }

    #[tokio::test]
    async fn test_unsafe_sender_severed_even_for_unknown_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen)
            .with_analyzer(Arc::new(FixedAnalyzer { safe: false }));
        hub.register_agent("rogue", Arc::new(Echo)).await;

        // addressing a name nobody holds must not dodge the consult
        let outcome = hub.route_message("rogue", "nobody", "rm -rf /").await;
        let DeliveryOutcome::Refused { reason } = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(reason, "unsafe");
        assert!(!hub.is_agent_enabled("rogue").await);
    }

    #[tokio::test]
    async fn test_toggling_qa_agent_drives_gate_harness() {
        use crate::quality::{
            AuditOutcome, DependencyAuditor, QualityGate, TestHarness, TestRun,
        };

        struct PassAuditor;
        impl DependencyAuditor for PassAuditor {
            fn audit(&self, _module: &Path) -> Result<AuditOutcome> {
                Ok(AuditOutcome {
                    success: true,
                    imports: vec![],
                    detail: "ok".to_string(),
                })
            }
        }
        struct FailHarness;
        impl TestHarness for FailHarness {
            fn run(&self, _module: &Path) -> Result<TestRun> {
                Ok(TestRun {
                    success: false,
                    returncode: Some(1),
                    output: "1 failed".to_string(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(QualityGate::new(
            Box::new(PassAuditor),
            Box::new(FailHarness),
        ));
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen).with_gate(Arc::clone(&gate));
        hub.register_agent(QA_AGENT, Arc::new(Echo)).await;

        let module = dir.path().join("m.py");
        std::fs::write(&module, "def f():\n    return 1\n").unwrap();
        assert!(gate.check_module(&module).blocked);

        hub.set_agent_enabled(QA_AGENT, false).await;
        assert!(!gate.check_module(&module).blocked);

        hub.set_agent_enabled(QA_AGENT, true).await;
        assert!(gate.check_module(&module).blocked);
    }

    #[tokio::test]
    async fn test_consult_timeout_fail_open_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen)
            .with_analyzer(Arc::new(StalledAnalyzer));
        hub.register_agent("coder", Arc::new(Echo)).await;

        let outcome = hub.route_message("ceo", "coder", "hi").await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered(_)));
    }

    #[tokio::test]
    async fn test_consult_timeout_fail_closed_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailClosed)
            .with_analyzer(Arc::new(StalledAnalyzer));
        hub.register_agent("coder", Arc::new(Echo)).await;

        let outcome = hub.route_message("ceo", "coder", "hi").await;
        let DeliveryOutcome::Refused { reason } = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(reason, "safety_unavailable");
    }

    #[tokio::test]
    async fn test_cut_communication_blocks_everything() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        hub.register_agent("coder", Arc::new(Echo)).await;

        hub.cut_communication();
        let outcome = hub.route_message("ceo", "coder", "hi").await;
        let DeliveryOutcome::Refused { reason } = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(reason, "communication_cut");

        hub.restore_communication();
        assert!(matches!(
            hub.route_message("ceo", "coder", "hi").await,
            DeliveryOutcome::Delivered(_)
        ));
    }

    #[tokio::test]
    async fn test_autonomous_loop_consumes_drop_files_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let absorber = Arc::new(CountingAbsorber {
            hits: AtomicUsize::new(0),
        });
        let hub = Arc::new(
            hub_in(dir.path(), ConsultPolicy::FailOpen).with_absorber(absorber.clone()),
        );

        let drop_dir = dir.path().join("drop");
        std::fs::write(drop_dir.join("note.txt"), "learn this\nand this\n").unwrap();
        std::fs::write(drop_dir.join("ignore.log"), "not an instruction").unwrap();

        let handle = hub.run_autonomous(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            while absorber.hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("instruction never absorbed");

        // processed exactly once, marker file left behind
        assert!(!drop_dir.join("note.txt").exists());
        assert!(drop_dir.join("note.txt.consumed").exists());
        assert!(drop_dir.join("ignore.log").exists());

        hub.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop in time")
            .unwrap();
        assert_eq!(absorber.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_code_topic_gates_only_newest_artifact() {
        use crate::quality::{
            AuditOutcome, DependencyAuditor, QualityGate, TestHarness, TestRun,
        };
        use std::sync::Mutex;

        struct RecordingAuditor {
            seen: Arc<Mutex<Vec<PathBuf>>>,
        }
        impl DependencyAuditor for RecordingAuditor {
            fn audit(&self, module: &Path) -> Result<AuditOutcome> {
                self.seen.lock().unwrap().push(module.to_path_buf());
                Ok(AuditOutcome {
                    success: true,
                    imports: vec![],
                    detail: "ok".to_string(),
                })
            }
        }
        struct PassHarness;
        impl TestHarness for PassHarness {
            fn run(&self, _module: &Path) -> Result<TestRun> {
                Ok(TestRun {
                    success: true,
                    returncode: Some(0),
                    output: String::new(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(QualityGate::new(
            Box::new(RecordingAuditor {
                seen: Arc::clone(&seen),
            }),
            Box::new(PassHarness),
        ));
        let absorber = Arc::new(CountingAbsorber {
            hits: AtomicUsize::new(0),
        });
        let hub = Arc::new(
            hub_in(dir.path(), ConsultPolicy::FailOpen)
                .with_absorber(absorber.clone())
                .with_gate(gate),
        );

        let topic_dir = dir.path().join("generated/code_fib");
        std::fs::create_dir_all(&topic_dir).unwrap();
        let older = topic_dir.join("20240101T000000000Z_fib.py");
        let newer = topic_dir.join("20240102T000000000Z_fib.py");
        std::fs::write(&older, "def fib_v1():\n    return 1\n").unwrap();
        std::fs::write(&newer, "def fib_v2():\n    return 1\n").unwrap();
        std::fs::write(dir.path().join("drop/code_fib.txt"), "ship fib\n").unwrap();

        let handle = hub.run_autonomous(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            while absorber.hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("instruction never absorbed");
        hub.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop in time")
            .unwrap();

        // only the most recent artifact is inspected
        assert_eq!(*seen.lock().unwrap(), vec![newer]);
    }

    #[tokio::test]
    async fn test_list_agents_sorted_with_flags() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path(), ConsultPolicy::FailOpen);
        hub.register_agent("zeta", Arc::new(Echo)).await;
        hub.register_agent("alpha", Arc::new(Echo)).await;
        hub.set_agent_enabled("zeta", false).await;

        let listing = hub.list_agents().await;
        assert_eq!(
            listing,
            vec![("alpha".to_string(), true), ("zeta".to_string(), false)]
        );
    }
}
