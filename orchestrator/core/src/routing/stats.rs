//! Orchestrator Statistics
//!
//! Lock-free request counters, cheap enough to bump on every attempt.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for the request path
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    /// Requests received by the facade
    pub requests: Counter,
    /// Requests answered successfully
    pub successes: Counter,
    /// Requests that exhausted every candidate
    pub exhausted: Counter,
    /// Requests cancelled by the caller
    pub cancelled: Counter,
    /// Requests rejected before dispatch (budget, no candidates)
    pub rejected: Counter,
    /// Backend calls made
    pub attempts: Counter,
    /// Attempts made after a prior candidate failed
    pub failovers: Counter,
    /// Candidates skipped because their circuit was open
    pub circuit_skips: Counter,
    /// Candidates skipped because their budget was spent
    pub budget_skips: Counter,
}

impl OrchestratorStats {
    /// Create zeroed stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.get(),
            successes: self.successes.get(),
            exhausted: self.exhausted.get(),
            cancelled: self.cancelled.get(),
            rejected: self.rejected.get(),
            attempts: self.attempts.get(),
            failovers: self.failovers.get(),
            circuit_skips: self.circuit_skips.get(),
            budget_skips: self.budget_skips.get(),
        }
    }
}

/// Serializable copy of [`OrchestratorStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests received
    pub requests: u64,
    /// Successful requests
    pub successes: u64,
    /// Exhausted requests
    pub exhausted: u64,
    /// Cancelled requests
    pub cancelled: u64,
    /// Rejected requests
    pub rejected: u64,
    /// Backend calls
    pub attempts: u64,
    /// Failover attempts
    pub failovers: u64,
    /// Circuit-open skips
    pub circuit_skips: u64,
    /// Budget skips
    pub budget_skips: u64,
}

impl StatsSnapshot {
    /// Successes over requests, 1.0 with no traffic
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}
