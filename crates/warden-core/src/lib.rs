//! Warden Core - an autonomous propose / approve / generate / integrate pipeline
//!
//! Warden takes change requests from creation to integration under human
//! control at every irreversible step:
//!
//! 1. **Request Ledger** (`ledger`): the request state machine and the Black
//!    Vault of permanently suppressed content
//! 2. **Notification fan-out** (`notify`): bounded-queue delivery of
//!    approval events to registered listeners
//! 3. **Artifact Generator** (`generator`): style-templated code generation
//!    with syntax validation and style fallback
//! 4. **Quality Gate** (`quality`): dependency audit and test harness run
//!    over every artifact before integration
//! 5. **Staging and Integration** (`staging`, `integration`): the waiting
//!    room, reversible reference-line integration, and rollback
//! 6. **Orchestrator Hub** (`hub`): agent registry, safety-gated message
//!    routing, and the autonomous drop-directory loop
//!
//! Everything persists as JSON through the durable [`store::KeyedStore`]
//! (atomic rename plus an advisory lock file), so state survives restarts
//! and concurrent writers.
//!
//! # Quick Start
//!
//! ```no_run
//! use warden_core::ledger::{RequestLedger, RequestPriority};
//! use warden_core::notify::ApprovalNotifier;
//! use warden_core::store::KeyedStore;
//! use warden_core::telemetry::TelemetrySink;
//!
//! # #[tokio::main]
//! # async fn main() -> warden_core::error::Result<()> {
//! let store = KeyedStore::new();
//! let ledger = RequestLedger::open(
//!     store,
//!     "data/requests.json",
//!     ApprovalNotifier::new(200, 4),
//!     TelemetrySink::disabled(),
//! )?;
//!
//! if let Some(id) = ledger.create(
//!     "docs",
//!     "write hello world function",
//!     RequestPriority::Medium,
//! )? {
//!     ledger.approve(&id, "approved by reviewer").await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod access;
pub mod audit;
pub mod config;
pub mod error;
pub mod generator;
pub mod hub;
pub mod integration;
pub mod ledger;
pub mod notify;
pub mod quality;
pub mod staging;
pub mod store;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use access::{AccessControl, CredentialHasher};
pub use config::{ConsultPolicy, WardenConfig};
pub use error::{Result, WardenError};
pub use generator::{ArtifactGenerator, CodingStyle, ImplementOutcome};
pub use hub::{DeliveryOutcome, Hub};
pub use integration::{IntegrationOutcome, IntegrationReport, Integrator};
pub use ledger::{Request, RequestLedger, RequestPriority, RequestStatus};
pub use notify::{ApprovalListener, ApprovalNotifier};
pub use quality::{ImportScanAuditor, PytestHarness, QualityGate};
pub use staging::{ActivationOutcome, StagingArea};
pub use store::KeyedStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
