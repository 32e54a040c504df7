//! Orchestrator Errors
//!
//! Every failure surfaced by the public API is an [`OrchestratorError`].
//! Per-backend failures collected during failover are kept as
//! [`AttemptError`] values so callers can see exactly what happened to each
//! candidate before the request was given up on.

use std::time::Duration;

use thiserror::Error;

use crate::routing::config::ConfigError;
use crate::routing::ledger::BudgetScope;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors returned by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The named backend is not registered
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// A backend with this name is already registered
    #[error("backend already registered: {0}")]
    DuplicateBackend(String),

    /// Every candidate was tried (or skipped) without a success
    #[error(
        "all backends exhausted after {} attempt(s): {}",
        .attempts.len(),
        summarize(.attempts)
    )]
    AllBackendsExhausted {
        /// Per-candidate outcomes, in the order they were tried
        attempts: Vec<AttemptError>,
    },

    /// A hard-stop budget blocked dispatch
    #[error("budget exceeded for {scope}: spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded {
        /// Which budget tripped
        scope: BudgetScope,
        /// Spend in the current period
        spent: f64,
        /// Configured limit
        limit: f64,
    },

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Selection produced no candidates
    #[error("no eligible backend for strategy '{strategy}'")]
    NoEligibleBackend {
        /// Strategy that was in effect
        strategy: String,
    },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Per-attempt errors, if this is an exhaustion error
    #[must_use]
    pub fn attempts(&self) -> &[AttemptError] {
        match self {
            Self::AllBackendsExhausted { attempts } => attempts,
            _ => &[],
        }
    }
}

fn summarize(attempts: &[AttemptError]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a single failed or skipped candidate
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{backend}: {kind}")]
pub struct AttemptError {
    /// Backend name
    pub backend: String,
    /// What went wrong
    pub kind: AttemptErrorKind,
}

impl AttemptError {
    /// Create a new attempt error
    pub fn new(backend: impl Into<String>, kind: AttemptErrorKind) -> Self {
        Self {
            backend: backend.into(),
            kind,
        }
    }
}

/// Why a candidate did not produce a response
#[derive(Clone, Debug, PartialEq, Error)]
pub enum AttemptErrorKind {
    /// Skipped because its circuit was open
    #[error("skipped: circuit open")]
    CircuitOpen,

    /// Skipped because its hard-stop budget is spent
    #[error("skipped: budget exceeded")]
    BudgetExceeded,

    /// The attempt ran past the per-attempt timeout
    #[error("timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Timeout that elapsed
        after: Duration,
    },

    /// The backend returned an error
    #[error("failed: {message}")]
    Failed {
        /// Backend error message
        message: String,
    },
}

impl AttemptErrorKind {
    /// True if the candidate was never called
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::BudgetExceeded)
    }
}
