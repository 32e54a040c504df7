//! Backend Health Tracking
//!
//! Per-backend rolling health derived from call outcomes and probe results.
//!
//! ```text
//!              first success
//! +---------+ ---------------> +---------+   slow success   +----------+
//! | Unknown |                  | Healthy | ---------------> | Degraded |
//! +---------+                  +---------+ <--------------- +----------+
//!      |                            |        fast success        |
//!      |                            | N consecutive failures     |
//!      |                            v                            |
//!      +--------------------> +-----------+ <--------------------+
//!                             | Unhealthy |
//!                             +-----------+
//!                                   | any success -> Healthy / Degraded
//! ```
//!
//! # Thread Safety
//!
//! Records live in a `DashMap`; each record is behind its own mutex so
//! concurrent outcomes for one backend never lose an update.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::HealthConfig;

// ============================================================================
// Health State
// ============================================================================

/// Coarse health classification
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No data yet
    #[default]
    Unknown,
    /// Succeeding within the latency threshold
    Healthy,
    /// Succeeding, but slowly
    Degraded,
    /// Too many consecutive failures
    Unhealthy,
}

impl HealthState {
    /// Whether selection should consider the backend
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    /// Whether the backend is known to be serving
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Health Status
// ============================================================================

/// Health record for one backend
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Backend name
    pub backend: String,
    /// Current classification
    pub state: HealthState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Outcomes recorded
    pub total_requests: u64,
    /// Successful outcomes
    pub successful_requests: u64,
    /// Failed outcomes
    pub failed_requests: u64,
    /// When the last success was recorded
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the last failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Latency of the last success
    pub last_latency: Option<Duration>,
    /// Message of the last failure
    pub last_error: Option<String>,
}

impl HealthStatus {
    fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            state: HealthState::Unknown,
            consecutive_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_success_at: None,
            last_failure_at: None,
            last_latency: None,
            last_error: None,
        }
    }

    /// Successes over total, 0.0 with no data
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Aggregate counts across all tracked backends
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateHealthStats {
    /// Backends tracked
    pub total_backends: usize,
    /// In `Healthy`
    pub healthy: usize,
    /// In `Degraded`
    pub degraded: usize,
    /// In `Unhealthy`
    pub unhealthy: usize,
    /// In `Unknown`
    pub unknown: usize,
    /// Sum of outcomes
    pub total_requests: u64,
    /// Sum of successes
    pub successful_requests: u64,
}

// ============================================================================
// Health Tracker
// ============================================================================

/// Tracks health for every backend by name
#[derive(Debug, Default)]
pub struct HealthTracker {
    backends: DashMap<String, Arc<Mutex<HealthStatus>>>,
    config: HealthConfig,
}

impl HealthTracker {
    /// Create a tracker
    pub fn new(config: HealthConfig) -> Self {
        Self {
            backends: DashMap::new(),
            config,
        }
    }

    fn record(&self, backend: &str) -> Arc<Mutex<HealthStatus>> {
        if let Some(existing) = self.backends.get(backend) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.backends
                .entry(backend.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HealthStatus::new(backend))))
                .value(),
        )
    }

    /// Record a successful call or probe
    pub fn record_success(&self, backend: &str, latency: Duration) -> HealthState {
        let record = self.record(backend);
        let mut status = record.lock();
        let previous = status.state;

        status.consecutive_failures = 0;
        status.total_requests += 1;
        status.successful_requests += 1;
        status.last_success_at = Some(Utc::now());
        status.last_latency = Some(latency);
        status.state = if latency > self.config.degraded_latency() {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        if previous != status.state {
            tracing::info!(
                backend = %backend,
                from = %previous,
                to = %status.state,
                latency_ms = latency.as_millis() as u64,
                "backend health changed"
            );
        }
        status.state
    }

    /// Record a failed call or probe
    pub fn record_failure(&self, backend: &str, error: impl Into<String>) -> HealthState {
        let record = self.record(backend);
        let mut status = record.lock();
        let previous = status.state;

        status.consecutive_failures += 1;
        status.total_requests += 1;
        status.failed_requests += 1;
        status.last_failure_at = Some(Utc::now());
        status.last_error = Some(error.into());
        if status.consecutive_failures >= self.config.unhealthy_threshold {
            status.state = HealthState::Unhealthy;
        }

        if previous != status.state {
            tracing::warn!(
                backend = %backend,
                consecutive_failures = status.consecutive_failures,
                error = status.last_error.as_deref().unwrap_or_default(),
                "backend marked unhealthy"
            );
        }
        status.state
    }

    /// Current status, creating an `Unknown` record on first reference
    pub fn status(&self, backend: &str) -> HealthStatus {
        self.record(backend).lock().clone()
    }

    /// Current state
    pub fn state(&self, backend: &str) -> HealthState {
        self.record(backend).lock().state
    }

    /// Statuses for every tracked backend, sorted by name
    pub fn all_statuses(&self) -> Vec<HealthStatus> {
        let mut statuses: Vec<_> = self
            .backends
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        statuses.sort_by(|a, b| a.backend.cmp(&b.backend));
        statuses
    }

    /// Forget history and return to `Unknown`
    pub fn reset(&self, backend: &str) {
        if let Some(entry) = self.backends.get(backend) {
            *entry.value().lock() = HealthStatus::new(backend);
            tracing::info!(backend = %backend, "backend health reset");
        }
    }

    /// Stop tracking a backend
    pub fn remove(&self, backend: &str) {
        self.backends.remove(backend);
    }

    /// Counts across every tracked backend
    pub fn aggregate_stats(&self) -> AggregateHealthStats {
        let mut stats = AggregateHealthStats::default();
        for entry in &self.backends {
            let status = entry.value().lock();
            stats.total_backends += 1;
            stats.total_requests += status.total_requests;
            stats.successful_requests += status.successful_requests;
            match status.state {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Unhealthy => stats.unhealthy += 1,
                HealthState::Unknown => stats.unknown += 1,
            }
        }
        stats
    }
}
