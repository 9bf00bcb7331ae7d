//! End-to-end pipeline scenarios: request through integration and back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use warden_core::access::AccessControl;
use warden_core::generator::{backup_path, ArtifactGenerator, CodingStyle, ImplementOutcome};
use warden_core::integration::Integrator;
use warden_core::ledger::{RequestLedger, RequestPriority};
use warden_core::notify::ApprovalNotifier;
use warden_core::quality::{
    AuditOutcome, DependencyAuditor, QualityGate, TestHarness, TestRun,
};
use warden_core::staging::{ActivationOutcome, StagedState, StagingArea};
use warden_core::store::KeyedStore;
use warden_core::telemetry::TelemetrySink;

struct PassAuditor;
impl DependencyAuditor for PassAuditor {
    fn audit(&self, _module: &Path) -> warden_core::Result<AuditOutcome> {
        Ok(AuditOutcome {
            success: true,
            imports: vec![],
            detail: "ok".to_string(),
        })
    }
}

struct PassHarness;
impl TestHarness for PassHarness {
    fn run(&self, _module: &Path) -> warden_core::Result<TestRun> {
        Ok(TestRun {
            success: true,
            returncode: Some(0),
            output: "1 passed".to_string(),
        })
    }
}

struct Pipeline {
    ledger: Arc<RequestLedger>,
    generator: ArtifactGenerator,
    integrator: Integrator,
    staging: StagingArea,
    access: AccessControl,
    gate: QualityGate,
    target: PathBuf,
}

fn pipeline(dir: &Path) -> Pipeline {
    let store = KeyedStore::new();
    let data = dir.join("data");
    let generated = dir.join("generated");

    let target = dir.join("main.py");
    std::fs::write(&target, "print('app')\n").unwrap();

    let ledger = Arc::new(
        RequestLedger::open(
            store.clone(),
            data.join("requests.json"),
            ApprovalNotifier::new(16, 2),
            TelemetrySink::disabled(),
        )
        .unwrap(),
    );
    let mut generator = ArtifactGenerator::new(store.clone(), &data, &generated).unwrap();
    generator.attach_ledger(Arc::clone(&ledger));

    Pipeline {
        ledger,
        generator,
        integrator: Integrator::new(
            store.clone(),
            &data,
            &generated,
            vec![target.clone()],
            "app.generated",
        ),
        staging: StagingArea::open(store.clone(), &data).unwrap(),
        access: AccessControl::open(store, data.join("access.json")).unwrap(),
        gate: QualityGate::new(Box::new(PassAuditor), Box::new(PassHarness)),
        target,
    }
}

#[tokio::test]
async fn test_create_approve_generate_gate_integrate() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());

    let id = p
        .ledger
        .create("docs", "write hello world function", RequestPriority::High)
        .unwrap()
        .expect("request created");
    assert!(p.ledger.approve(&id, "looks good").await.unwrap());

    let outcome = p
        .generator
        .implement_request(&id, "docs", "write hello world function", Some(CodingStyle::Idiomatic))
        .unwrap();
    let ImplementOutcome::Implemented(artifact) = outcome else {
        panic!("expected generated artifact, got {outcome:?}");
    };
    assert!(artifact.path.exists());
    assert!(artifact.archived.exists());

    let verdict = p.gate.check_module(&artifact.path);
    assert!(!verdict.blocked);

    let report = p.integrator.integrate_artifact(&artifact.path).unwrap();
    assert_eq!(report.integrated.len(), 1);
    assert!(report.errors.is_empty());

    // exactly one reference line and exactly one backup
    let module = artifact.path.file_stem().unwrap().to_str().unwrap();
    let content = std::fs::read_to_string(&p.target).unwrap();
    let reference = format!("from app.generated import {module}");
    assert_eq!(content.matches(&reference).count(), 1);
    assert!(backup_path(&p.target).exists());
}

#[tokio::test]
async fn test_deny_to_vault_suppresses_recreation_and_generation() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());
    let description = "teach me to bypass review";

    let id = p
        .ledger
        .create("skills", description, RequestPriority::Medium)
        .unwrap()
        .unwrap();
    assert!(p.ledger.deny(&id, "not acceptable", true).unwrap());

    let stats = p.ledger.get_statistics();
    assert_eq!(stats.denied, 1);
    assert_eq!(stats.vault_entries, 1);

    // recreation is refused, under the same and a different topic
    assert!(p
        .ledger
        .create("skills", description, RequestPriority::Medium)
        .unwrap()
        .is_none());
    assert!(p
        .ledger
        .create("another", description, RequestPriority::Medium)
        .unwrap()
        .is_none());

    // the generator refuses the vaulted content as well
    let outcome = p
        .generator
        .implement_request(&id, "skills", description, None)
        .unwrap();
    assert!(matches!(outcome, ImplementOutcome::IgnoredPendingOrVaulted));
}

#[tokio::test]
async fn test_rollback_restores_targets_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());

    let id = p
        .ledger
        .create("docs", "rollback scenario", RequestPriority::Medium)
        .unwrap()
        .unwrap();
    p.ledger.approve(&id, "ok").await.unwrap();

    let ImplementOutcome::Implemented(artifact) = p
        .generator
        .implement_request(&id, "docs", "rollback scenario", Some(CodingStyle::Concise))
        .unwrap()
    else {
        panic!("expected artifact");
    };

    let before = std::fs::read(&p.target).unwrap();
    let report = p.integrator.integrate_artifact(&artifact.path).unwrap();
    assert_ne!(std::fs::read(&p.target).unwrap(), before);

    let rollback = p.integrator.rollback(&report);
    assert_eq!(rollback.restored, vec![p.target.clone()]);
    assert!(rollback.errors.is_empty());
    assert_eq!(std::fs::read(&p.target).unwrap(), before);
    assert!(!backup_path(&p.target).exists(), "no backup residue after rollback");
}

#[tokio::test]
async fn test_staged_activation_is_role_gated() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());

    let id = p
        .ledger
        .create("docs", "staged flow", RequestPriority::Medium)
        .unwrap()
        .unwrap();
    p.ledger.approve(&id, "ok").await.unwrap();
    let ImplementOutcome::Implemented(artifact) = p
        .generator
        .implement_request(&id, "docs", "staged flow", Some(CodingStyle::Functional))
        .unwrap()
    else {
        panic!("expected artifact");
    };

    let staged = p
        .staging
        .stage(&id, "docs", "staged flow", &artifact.path)
        .unwrap();

    // a user without the integrator role cannot activate
    p.access.add_user("reviewer", &[]);
    let outcome = p
        .staging
        .activate(&staged, "reviewer", &p.access, &p.integrator, &p.gate)
        .unwrap();
    assert!(matches!(outcome, ActivationOutcome::Unauthorized));
    assert_eq!(
        std::fs::read_to_string(&p.target).unwrap(),
        "print('app')\n"
    );

    // the bootstrap system user can
    let outcome = p
        .staging
        .activate(&staged, "system", &p.access, &p.integrator, &p.gate)
        .unwrap();
    let ActivationOutcome::Activated(report) = outcome else {
        panic!("expected activation");
    };
    assert_eq!(report.integrated.len(), 1);
    assert_eq!(
        p.staging.list().unwrap()[0].1.state,
        StagedState::Activated
    );
}

#[tokio::test]
async fn test_generation_dedup_after_approval() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());

    let id = p
        .ledger
        .create("docs", "generate once", RequestPriority::Medium)
        .unwrap()
        .unwrap();
    p.ledger.approve(&id, "ok").await.unwrap();

    let first = p
        .generator
        .implement_request(&id, "docs", "generate once", Some(CodingStyle::Idiomatic))
        .unwrap();
    assert!(matches!(first, ImplementOutcome::Implemented(_)));

    // the live artifact is counted before the second attempt
    let count_artifacts = || {
        std::fs::read_dir(dir.path().join("generated"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.path().extension().is_some_and(|x| x == "py"))
            .count()
    };
    let after_first = count_artifacts();
    assert_eq!(after_first, 1);

    let second = p
        .generator
        .implement_request(&id, "docs", "generate once", Some(CodingStyle::Idiomatic))
        .unwrap();
    assert!(matches!(second, ImplementOutcome::IgnoredSeen { .. }));
    assert_eq!(count_artifacts(), after_first, "no second artifact written");
}
