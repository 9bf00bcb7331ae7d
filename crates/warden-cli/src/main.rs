use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use warden_core::access::AccessControl;
use warden_core::generator::{ArtifactGenerator, CodingStyle, FixOutcome, ImplementOutcome};
use warden_core::hub::{AbsorbReport, Absorber, Hub};
use warden_core::integration::{IntegrationOutcome, IntegrationReport, Integrator};
use warden_core::ledger::{RequestLedger, RequestPriority};
use warden_core::notify::ApprovalNotifier;
use warden_core::quality::{ImportScanAuditor, PytestHarness, QualityGate};
use warden_core::staging::{ActivationOutcome, StagingArea};
use warden_core::store::KeyedStore;
use warden_core::telemetry::TelemetrySink;
use warden_core::WardenConfig;

/// Warden - request, approve, generate, gate, integrate
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "warden.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage change requests
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },

    /// Generate an artifact for an approved request
    Generate {
        /// Request id
        id: String,
        /// Style tag; omit to use the current style
        #[arg(long)]
        style: Option<String>,
    },

    /// List available styles or set the current one
    Styles {
        /// Style tag to select, or "random"
        #[arg(long)]
        set: Option<String>,
    },

    /// Stage an artifact for later activation
    Stage {
        /// Request id
        id: String,
        /// Artifact path; defaults to the newest generated artifact
        #[arg(long)]
        artifact: Option<PathBuf>,
    },

    /// Activate a staged artifact (requires the integrator role)
    Activate {
        /// Path of the staged record
        staged: PathBuf,
        /// Acting user
        #[arg(long, default_value = "system")]
        user: String,
    },

    /// Gate-checked project-wide integration of every live artifact
    Integrate,

    /// Undo the last integration pass
    Rollback,

    /// Auto-fix one file or a whole tree
    Fix {
        /// File or directory to fix
        path: PathBuf,
    },

    /// Export the generator audit trail with a signature sidecar
    ExportAudit {
        /// Acting user (requires the expert role)
        #[arg(long, default_value = "system")]
        user: String,
    },

    /// Run the autonomous ingestion loop until interrupted
    Run,
}

#[derive(Subcommand)]
enum RequestAction {
    /// Create a request
    Create {
        /// Topic of the request
        topic: String,
        /// What should be implemented
        description: String,
        /// low, medium, or high
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    /// Approve a pending request
    Approve {
        /// Request id
        id: String,
        /// Reviewer response
        #[arg(long, default_value = "approved")]
        response: String,
    },
    /// Deny a request
    Deny {
        /// Request id
        id: String,
        /// Denial reason
        #[arg(long, default_value = "denied")]
        reason: String,
        /// Suppress this content permanently
        #[arg(long)]
        vault: bool,
    },
    /// List pending requests
    List,
    /// Show aggregate counters
    Stats,
}

struct App {
    config: WardenConfig,
    ledger: Arc<RequestLedger>,
    generator: ArtifactGenerator,
    integrator: Integrator,
    staging: StagingArea,
    access: AccessControl,
    gate: Arc<QualityGate>,
    store: KeyedStore,
}

fn build(config: WardenConfig) -> anyhow::Result<App> {
    let store = KeyedStore::with_timing(
        Duration::from_millis(config.lock_timeout_ms),
        Duration::from_millis(config.lock_stale_after_ms),
    );
    let data_dir = config.data_dir.clone();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let notifier = ApprovalNotifier::new(config.notify_capacity, config.notify_workers);
    let telemetry = TelemetrySink::new(
        config.telemetry_enabled,
        store.clone(),
        data_dir.join("telemetry.json"),
    );
    let ledger = Arc::new(RequestLedger::open(
        store.clone(),
        data_dir.join("requests.json"),
        notifier,
        telemetry,
    )?);

    let mut generator =
        ArtifactGenerator::new(store.clone(), &data_dir, &config.generated_dir)?;
    generator.attach_ledger(Arc::clone(&ledger));

    let gate = Arc::new(QualityGate::new(
        Box::new(ImportScanAuditor::new(config.audit_command.clone())),
        Box::new(PytestHarness::new(
            data_dir.join("quality_runs"),
            config.test_command.clone(),
        )),
    ));

    Ok(App {
        integrator: Integrator::new(
            store.clone(),
            &data_dir,
            &config.generated_dir,
            config.target_files.clone(),
            config.import_prefix.clone(),
        ),
        staging: StagingArea::open(store.clone(), &data_dir)?,
        access: AccessControl::open(store.clone(), data_dir.join("access.json"))?,
        config,
        ledger,
        generator,
        gate,
        store,
    })
}

fn parse_priority(text: &str) -> anyhow::Result<RequestPriority> {
    match text {
        "low" => Ok(RequestPriority::Low),
        "medium" => Ok(RequestPriority::Medium),
        "high" => Ok(RequestPriority::High),
        other => anyhow::bail!("unknown priority: {other} (expected low, medium, or high)"),
    }
}

fn last_report_path(config: &WardenConfig) -> PathBuf {
    config.data_dir.join("last_integration.json")
}

/// Absorber used by `run`: collects non-empty directive lines as facts
struct LoggingAbsorber;

#[async_trait::async_trait]
impl Absorber for LoggingAbsorber {
    async fn absorb(&self, path: &Path, content: &str) -> warden_core::Result<AbsorbReport> {
        let facts: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect();
        tracing::info!(path = %path.display(), facts = facts.len(), "absorbed instruction file");
        Ok(AbsorbReport { facts })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WardenConfig::load(&cli.config)?;
    let app = build(config)?;

    match cli.command {
        Commands::Request { action } => match action {
            RequestAction::Create {
                topic,
                description,
                priority,
            } => {
                let priority = parse_priority(&priority)?;
                match app.ledger.create(&topic, &description, priority)? {
                    Some(id) => println!("created request {id}"),
                    None => println!("request refused (empty input or vaulted content)"),
                }
            }
            RequestAction::Approve { id, response } => {
                if app.ledger.approve(&id, &response).await? {
                    println!("approved {id}");
                } else {
                    println!("unknown request {id}");
                }
            }
            RequestAction::Deny { id, reason, vault } => {
                if app.ledger.deny(&id, &reason, vault)? {
                    println!("denied {id}{}", if vault { " (vaulted)" } else { "" });
                } else {
                    println!("unknown request {id}");
                }
            }
            RequestAction::List => {
                let pending = app.ledger.get_pending();
                if pending.is_empty() {
                    println!("no pending requests");
                }
                for request in pending {
                    println!(
                        "{}  [{:?}]  {}: {}",
                        request.id, request.priority, request.topic, request.description
                    );
                }
            }
            RequestAction::Stats => {
                let stats = app.ledger.get_statistics();
                println!(
                    "pending: {}  approved: {}  denied: {}  vaulted: {}",
                    stats.pending, stats.approved, stats.denied, stats.vault_entries
                );
            }
        },

        Commands::Generate { id, style } => {
            let request = app
                .ledger
                .get(&id)
                .with_context(|| format!("unknown request {id}"))?;
            let style = match style {
                Some(tag) => Some(
                    CodingStyle::parse(&tag)
                        .with_context(|| format!("unknown style {tag}"))?,
                ),
                None => None,
            };
            let outcome = app.generator.implement_request(
                &request.id,
                &request.topic,
                &request.description,
                style,
            )?;
            match outcome {
                ImplementOutcome::Implemented(artifact) => {
                    println!("generated {} ({})", artifact.path.display(), artifact.style);
                    println!("archived at {}", artifact.archived.display());
                }
                ImplementOutcome::IgnoredSeen { fingerprint } => {
                    println!("ignored: content already processed ({fingerprint})");
                }
                ImplementOutcome::IgnoredPendingOrVaulted => {
                    println!("ignored: content is pending review or vaulted");
                }
                ImplementOutcome::ValidationFailed { tried, error } => {
                    println!("generation failed after {} styles: {error}", tried.len());
                }
            }
        }

        Commands::Styles { set } => match set {
            Some(tag) => {
                let style = if tag == "random" {
                    None
                } else {
                    Some(
                        CodingStyle::parse(&tag)
                            .with_context(|| format!("unknown style {tag}"))?,
                    )
                };
                println!("current style: {}", app.generator.set_style(style));
            }
            None => {
                let current = app.generator.current_style();
                for style in app.generator.list_styles() {
                    let marker = if style == current { "*" } else { " " };
                    println!("{marker} {style}");
                }
            }
        },

        Commands::Stage { id, artifact } => {
            let request = app
                .ledger
                .get(&id)
                .with_context(|| format!("unknown request {id}"))?;
            let artifact = match artifact {
                Some(path) => path,
                None => app
                    .integrator
                    .latest_artifact()
                    .context("no generated artifact to stage")?,
            };
            let staged = app.staging.stage(
                &request.id,
                &request.topic,
                &request.description,
                &artifact,
            )?;
            println!("staged at {}", staged.display());
        }

        Commands::Activate { staged, user } => {
            match app
                .staging
                .activate(&staged, &user, &app.access, &app.integrator, &app.gate)?
            {
                ActivationOutcome::Activated(report) => {
                    println!("activated: {} target(s) integrated", report.integrated.len());
                }
                ActivationOutcome::Unauthorized => {
                    println!("refused: {user} lacks the integrator role");
                }
                ActivationOutcome::MissingArtifact(path) => {
                    println!("refused: artifact {} is gone", path.display());
                }
                ActivationOutcome::Blocked(failures) => {
                    println!("blocked by the quality gate:");
                    for failure in failures {
                        println!(
                            "  {} [{:?}]: {}",
                            failure.module.display(),
                            failure.stage,
                            failure.detail
                        );
                    }
                }
            }
        }

        Commands::Integrate => {
            let outcome = app.integrator.integrate_across_project(
                app.config.allow_integration,
                &app.access,
                &app.gate,
            )?;
            match outcome {
                IntegrationOutcome::Integrated(report) => {
                    println!(
                        "integrated into {} target(s), {} skipped, {} error(s)",
                        report.integrated.len(),
                        report.skipped.len(),
                        report.errors.len()
                    );
                    app.store.write(&last_report_path(&app.config), &report)?;
                }
                IntegrationOutcome::NotAllowed => {
                    println!(
                        "integration not allowed (allow_integration = {})",
                        app.config.allow_integration
                    );
                }
                IntegrationOutcome::Blocked(failures) => {
                    println!("blocked by the quality gate ({} failure(s))", failures.len());
                    for failure in failures {
                        println!("  {}: {}", failure.module.display(), failure.detail);
                    }
                }
                IntegrationOutcome::NothingToIntegrate => {
                    println!("nothing to integrate: no generated artifact found");
                }
            }
        }

        Commands::Rollback => {
            let report: Option<IntegrationReport> =
                app.store.read(&last_report_path(&app.config))?;
            let Some(report) = report else {
                println!("no recorded integration to roll back");
                return Ok(());
            };
            let result = app.integrator.rollback(&report);
            println!(
                "restored {} target(s), {} error(s)",
                result.restored.len(),
                result.errors.len()
            );
            for (target, error) in &result.errors {
                println!("  {}: {error}", target.display());
            }
            if result.errors.is_empty() {
                std::fs::remove_file(last_report_path(&app.config)).ok();
            }
        }

        Commands::Fix { path } => {
            if path.is_dir() {
                let report = app.generator.fix_repo(&path);
                println!(
                    "processed {} file(s), {} error(s)",
                    report.fixed.len(),
                    report.errors.len()
                );
                for (file, error) in &report.errors {
                    println!("  {}: {error}", file.display());
                }
            } else {
                match app.generator.auto_fix_file(&path)? {
                    FixOutcome::Fixed { backup } => {
                        println!("fixed {} (backup at {})", path.display(), backup.display());
                    }
                    FixOutcome::Unchanged => println!("already clean"),
                    FixOutcome::Unsupported => println!("unsupported file type"),
                    FixOutcome::SyntaxRejected { error } => {
                        println!("left untouched, fix would not parse: {error}");
                    }
                }
            }
        }

        Commands::ExportAudit { user } => {
            let export = app.generator.export_audit(&user, &app.access, None)?;
            println!("exported to {}", export.out.display());
            println!("signature {} ({})", export.signature, export.signature_path.display());
        }

        Commands::Run => {
            let hub = Arc::new(
                Hub::new(
                    app.store.clone(),
                    &app.config.data_dir,
                    &app.config.drop_dir,
                    &app.config.generated_dir,
                    app.config.consult_policy,
                    Duration::from_millis(app.config.consult_timeout_ms),
                )?
                .with_absorber(Arc::new(LoggingAbsorber))
                .with_gate(Arc::clone(&app.gate)),
            );
            let handle =
                hub.run_autonomous(Duration::from_secs(app.config.autolearn_interval_secs));
            println!(
                "autonomous loop running (drop dir: {}), ctrl-c to stop",
                app.config.drop_dir.display()
            );
            tokio::signal::ctrl_c().await?;
            hub.stop();
            handle.await?;
            println!("stopped");
        }
    }

    Ok(())
}
