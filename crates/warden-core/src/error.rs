//! Error types for Warden Core
//!
//! This module defines all error types used throughout the Warden pipeline.
//! We use `thiserror` for ergonomic error definitions with automatic Display/Error implementations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Main error type for Warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// An unknown request, staged entry, or artifact id was referenced
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requester lacks the role required for the operation
    #[error("Unauthorized: user '{user}' lacks role '{role}'")]
    Unauthorized {
        /// The principal that attempted the operation
        user: String,
        /// The role that would have been required
        role: String,
    },

    /// A path-scoped lock could not be acquired within the configured timeout.
    /// Callers must treat this as retryable, not as data loss.
    #[error("Lock timeout after {waited_ms}ms for {path}")]
    LockTimeout {
        /// Path whose lock could not be acquired
        path: PathBuf,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// No style produced syntactically valid code
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The Quality Gate blocked an integration
    #[error("Integration blocked by quality gate: {0} failure(s)")]
    IntegrationBlocked(usize),

    /// A referenced artifact is no longer on disk
    #[error("Missing artifact: {0}")]
    MissingArtifact(PathBuf),

    /// Persisted state was unreadable. Readers treat this as "absent";
    /// the variant exists for callers that need to surface it explicitly.
    #[error("Corrupted state at {0}")]
    Corrupted(PathBuf),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        /// Human-readable context for the underlying error
        context: String,
        /// The wrapped error
        source: Box<WardenError>,
    },
}

impl WardenError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Machine-checkable reason string for a failure result.
    ///
    /// Every mutating operation in the pipeline reports failures with a
    /// stable reason rather than an unstructured exception.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::ValidationFailed(_) => "validation_failed",
            Self::IntegrationBlocked(_) => "integration_blocked",
            Self::MissingArtifact(_) => "missing_artifact",
            Self::Corrupted(_) => "corrupted",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::WithContext { source, .. } => source.reason(),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    WardenError: From<E>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| WardenError::from(e).context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| WardenError::from(e).context(f()))
    }
}
