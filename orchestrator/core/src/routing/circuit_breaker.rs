//! Circuit Breaker
//!
//! Stops dispatch to a backend that keeps failing, then lets a single trial
//! call through once a cooldown has passed.
//!
//! ```text
//! +--------+   N consecutive failures   +------+   cooldown elapsed   +-----------+
//! | Closed | -------------------------> | Open | -------------------> | Half-Open |
//! +--------+                            +------+                      +-----------+
//!     ^                                    ^       trial failed            |
//!     |                                    |  (cooldown *= multiplier)     |
//!     |                                    +-------------------------------+
//!     |                 trial succeeded                                    |
//!     +--------------------------------------------------------------------+
//! ```
//!
//! Half-open admits exactly one in-flight trial. The Open -> Half-Open
//! transition happens lazily inside [`CircuitBreaker::is_call_allowed`], so no
//! timer is needed.
//!
//! Dispatch goes through [`CircuitBreaker::acquire`], whose [`CallPermit`]
//! hands the trial slot back when dropped without an outcome. A request
//! abandoned mid-trial therefore leaves the breaker half-open and ready for
//! the next trial.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::config::CircuitBreakerConfig;

/// Breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl BreakerRecord {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: base_cooldown,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.cooldown = cooldown;
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    /// Backend name
    pub backend: String,
    /// Current state
    pub state: CircuitState,
    /// Failures counted toward opening
    pub consecutive_failures: u32,
    /// Cooldown applied on the current or next open
    pub cooldown: Duration,
    /// Time left before a trial is allowed, while open
    pub open_remaining: Option<Duration>,
}

/// Per-backend circuit breakers
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    breakers: DashMap<String, Arc<Mutex<BreakerRecord>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker set
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    fn record(&self, backend: &str) -> Arc<Mutex<BreakerRecord>> {
        if let Some(existing) = self.breakers.get(backend) {
            return Arc::clone(existing.value());
        }
        let base = self.config.base_cooldown();
        Arc::clone(
            self.breakers
                .entry(backend.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerRecord::new(base))))
                .value(),
        )
    }

    /// Whether a call may be dispatched now
    ///
    /// May move Open -> Half-Open, in which case the caller holds the trial
    /// slot and must report the outcome (or [`release_trial`](Self::release_trial)).
    /// Prefer [`acquire`](Self::acquire), which releases the slot on drop.
    pub fn is_call_allowed(&self, backend: &str) -> bool {
        self.admit(backend).is_some()
    }

    /// Admit a call, returning a permit that reports its outcome
    pub fn acquire(&self, backend: &str) -> Option<CallPermit<'_>> {
        let trial = self.admit(backend)?;
        Some(CallPermit {
            breaker: self,
            backend: backend.to_string(),
            trial,
            settled: false,
        })
    }

    /// `Some(true)` when the admitted call is the half-open trial
    fn admit(&self, backend: &str) -> Option<bool> {
        let record = self.record(backend);
        let mut breaker = record.lock();
        match breaker.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map_or(Duration::MAX, |opened| opened.elapsed());
                if elapsed >= breaker.cooldown {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_in_flight = true;
                    tracing::info!(backend = %backend, "circuit half-open, admitting trial call");
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    None
                } else {
                    breaker.trial_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    /// Report the outcome of a dispatched call
    pub fn on_outcome(&self, backend: &str, success: bool) {
        let record = self.record(backend);
        let mut breaker = record.lock();

        if success {
            if breaker.state != CircuitState::Closed {
                tracing::info!(backend = %backend, "circuit closed");
            }
            *breaker = BreakerRecord::new(self.config.base_cooldown());
            return;
        }

        breaker.consecutive_failures += 1;
        match breaker.state {
            CircuitState::Closed => {
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    let cooldown = self.config.base_cooldown();
                    breaker.open(cooldown);
                    tracing::warn!(
                        backend = %backend,
                        failures = breaker.consecutive_failures,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                let cooldown = self.config.next_cooldown(breaker.cooldown);
                breaker.open(cooldown);
                tracing::warn!(
                    backend = %backend,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "trial call failed, circuit re-opened"
                );
            }
            // A call admitted before the circuit opened; the open window stands.
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open trial slot without an outcome
    pub fn release_trial(&self, backend: &str) {
        if let Some(entry) = self.breakers.get(backend) {
            let mut breaker = entry.value().lock();
            if breaker.state == CircuitState::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Current state without side effects
    pub fn state(&self, backend: &str) -> CircuitState {
        self.breakers
            .get(backend)
            .map_or(CircuitState::Closed, |entry| entry.value().lock().state)
    }

    /// Detailed view of one breaker
    pub fn snapshot(&self, backend: &str) -> CircuitSnapshot {
        let record = self.record(backend);
        let breaker = record.lock();
        let open_remaining = match (breaker.state, breaker.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(breaker.cooldown.saturating_sub(opened.elapsed()))
            }
            _ => None,
        };
        CircuitSnapshot {
            backend: backend.to_string(),
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            cooldown: breaker.cooldown,
            open_remaining,
        }
    }

    /// Close the circuit and clear history
    pub fn reset(&self, backend: &str) {
        if let Some(entry) = self.breakers.get(backend) {
            *entry.value().lock() = BreakerRecord::new(self.config.base_cooldown());
            tracing::info!(backend = %backend, "circuit reset");
        }
    }

    /// Open the circuit immediately with the base cooldown
    pub fn force_open(&self, backend: &str) {
        let record = self.record(backend);
        record.lock().open(self.config.base_cooldown());
        tracing::warn!(backend = %backend, "circuit forced open");
    }

    /// Stop tracking a backend
    pub fn remove(&self, backend: &str) {
        self.breakers.remove(backend);
    }
}

// ============================================================================
// Call Permit
// ============================================================================

/// An admitted call
///
/// Report the outcome with [`record`](Self::record). Dropping the permit
/// without an outcome gives back the half-open trial slot, if it holds one.
#[derive(Debug)]
#[must_use = "dropping a permit abandons the call without an outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    backend: String,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open trial
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the call's outcome
    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.on_outcome(&self.backend, success);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::debug!(backend = %self.backend, "trial abandoned, releasing slot");
            self.breaker.release_trial(&self.backend);
        }
    }
}
