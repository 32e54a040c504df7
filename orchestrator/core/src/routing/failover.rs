//! Failover Sequencing
//!
//! Walks an ordered candidate list, calling one backend at a time until one
//! succeeds, the retry budget is spent, or the caller cancels.
//!
//! For every candidate, in order:
//!
//! 1. A spent hard-stop budget skips it.
//! 2. An open circuit skips it. Skips do not use up a retry unless
//!    `count_circuit_skips` is set.
//! 3. Otherwise the backend is called under the per-attempt timeout, racing
//!    the caller's cancellation token.
//!
//! Every completed attempt feeds health and the circuit breaker. A
//! cancelled attempt feeds nothing and gives back any half-open trial slot,
//! including when the caller drops the request future mid-attempt. Outcomes
//! for a backend unregistered while its call was in flight are not recorded
//! against health or the breaker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::CircuitBreaker;
use super::config::FailoverConfig;
use super::health::HealthTracker;
use super::ledger::{BudgetCheck, BudgetScope, CostLedger};
use super::registry::{ProviderRegistry, RegisteredBackend};
use super::stats::OrchestratorStats;
use crate::backend::{BackendError, TokenUsage};
use crate::error::{AttemptError, AttemptErrorKind, OrchestratorError, Result};

/// What a successful attempt hands back to the sequencer
#[derive(Clone, Debug)]
pub struct AttemptSuccess<T> {
    /// Operation result
    pub value: T,
    /// Tokens consumed
    pub usage: TokenUsage,
}

/// Result of a sequenced request
#[derive(Clone, Debug)]
pub struct FailoverOutcome<T> {
    /// Operation result
    pub value: T,
    /// Backend that produced it
    pub backend: String,
    /// Tokens consumed by the successful attempt
    pub usage: TokenUsage,
    /// Cost of the successful attempt in USD
    pub cost: f64,
    /// Latency of the successful attempt
    pub latency: Duration,
    /// Candidates that failed or were skipped first
    pub failed_attempts: Vec<AttemptError>,
}

/// Runs the failover loop against shared health, breaker and ledger state
#[derive(Debug, Clone)]
pub struct FailoverSequencer {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<CostLedger>,
    stats: Arc<OrchestratorStats>,
}

impl FailoverSequencer {
    /// Create a sequencer
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        breaker: Arc<CircuitBreaker>,
        ledger: Arc<CostLedger>,
        stats: Arc<OrchestratorStats>,
    ) -> Self {
        Self {
            registry,
            health,
            breaker,
            ledger,
            stats,
        }
    }

    /// Try candidates in order until one succeeds
    ///
    /// `attempt` performs the call for one backend. It receives a child of
    /// `cancel` that is also fired when the attempt times out.
    pub async fn execute<T, F, Fut>(
        &self,
        candidates: &[Arc<RegisteredBackend>],
        config: &FailoverConfig,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<FailoverOutcome<T>>
    where
        F: FnMut(Arc<RegisteredBackend>, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<AttemptSuccess<T>, BackendError>>,
    {
        let timeout = config.attempt_timeout();
        let mut failed: Vec<AttemptError> = Vec::new();
        let mut retries_used: u32 = 0;
        let mut calls_made: u32 = 0;
        let mut first_budget_block: Option<(BudgetScope, f64, f64)> = None;

        for backend in candidates {
            if retries_used >= config.max_retries {
                tracing::debug!(max_retries = config.max_retries, "retry limit reached");
                break;
            }
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let name = backend.name();

            let scope = BudgetScope::backend(name);
            if let BudgetCheck::Exceeded { spent, limit } = self.ledger.check_budget(&scope) {
                tracing::warn!(backend = %name, spent, limit, "skipping backend, budget exhausted");
                self.stats.budget_skips.inc();
                failed.push(AttemptError::new(name, AttemptErrorKind::BudgetExceeded));
                first_budget_block.get_or_insert((scope, spent, limit));
                continue;
            }

            let Some(permit) = self.breaker.acquire(name) else {
                tracing::debug!(backend = %name, "skipping backend, circuit open");
                self.stats.circuit_skips.inc();
                failed.push(AttemptError::new(name, AttemptErrorKind::CircuitOpen));
                if config.count_circuit_skips {
                    retries_used += 1;
                }
                continue;
            };

            retries_used += 1;
            calls_made += 1;
            self.stats.attempts.inc();
            if calls_made > 1 {
                self.stats.failovers.inc();
            }

            let attempt_token = cancel.child_token();
            let started = Instant::now();
            let call = tokio::time::timeout(
                timeout,
                attempt(Arc::clone(backend), attempt_token.clone()),
            );
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = call => Some(result),
            };
            let latency = started.elapsed();

            let Some(result) = result else {
                attempt_token.cancel();
                tracing::info!(backend = %name, "request cancelled during attempt");
                return Err(OrchestratorError::Cancelled);
            };

            let registered = self.is_registered(backend);
            if !registered {
                tracing::debug!(backend = %name, "backend unregistered mid-attempt, outcome not recorded");
            }

            match result {
                Ok(Ok(success)) => {
                    if registered {
                        self.health.record_success(name, latency);
                        permit.record(true);
                    }
                    let cost = self.ledger.record_usage(
                        name,
                        success.usage.input_tokens,
                        success.usage.output_tokens,
                    );
                    tracing::debug!(
                        backend = %name,
                        latency_ms = latency.as_millis() as u64,
                        cost,
                        "attempt succeeded"
                    );
                    return Ok(FailoverOutcome {
                        value: success.value,
                        backend: name.to_string(),
                        usage: success.usage,
                        cost,
                        latency,
                        failed_attempts: failed,
                    });
                }
                Ok(Err(BackendError::Cancelled)) if cancel.is_cancelled() => {
                    return Err(OrchestratorError::Cancelled);
                }
                Ok(Err(err)) => {
                    let message = err.to_string();
                    tracing::warn!(backend = %name, error = %message, "attempt failed");
                    if registered {
                        self.health.record_failure(name, message.clone());
                        permit.record(false);
                    }
                    failed.push(AttemptError::new(name, AttemptErrorKind::Failed { message }));
                }
                Err(_elapsed) => {
                    attempt_token.cancel();
                    tracing::warn!(
                        backend = %name,
                        timeout_ms = timeout.as_millis() as u64,
                        "attempt timed out"
                    );
                    if registered {
                        self.health.record_failure(
                            name,
                            format!("timed out after {}ms", timeout.as_millis()),
                        );
                        permit.record(false);
                    }
                    failed.push(AttemptError::new(
                        name,
                        AttemptErrorKind::Timeout { after: timeout },
                    ));
                }
            }
        }

        if calls_made == 0 {
            if let Some((scope, spent, limit)) = first_budget_block {
                if failed
                    .iter()
                    .all(|e| e.kind == AttemptErrorKind::BudgetExceeded)
                {
                    return Err(OrchestratorError::BudgetExceeded {
                        scope,
                        spent,
                        limit,
                    });
                }
            }
        }

        Err(OrchestratorError::AllBackendsExhausted { attempts: failed })
    }

    /// Whether `backend` is still the registry's entry under its name
    fn is_registered(&self, backend: &Arc<RegisteredBackend>) -> bool {
        self.registry
            .get(backend.name())
            .is_ok_and(|current| Arc::ptr_eq(&current, backend))
    }
}
