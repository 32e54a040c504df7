//! Orchestrator Configuration
//!
//! Tunables for health tracking, the circuit breaker, failover and the
//! background health monitor. Everything has a sensible default; values can
//! be loaded from TOML and then overridden from `ORCHESTRATOR_*` environment
//! variables.
//!
//! ```toml
//! default_strategy = "least_cost"
//! stream_failover = "buffered_restart"
//!
//! [health]
//! unhealthy_threshold = 3
//! degraded_latency_ms = 5000
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! base_cooldown_ms = 30000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::selector::SelectionStrategy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Validation(String),
}

// ============================================================================
// Health
// ============================================================================

/// Health tracker thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a backend is marked unhealthy
    pub unhealthy_threshold: u32,
    /// Successful calls slower than this mark the backend degraded
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            degraded_latency_ms: 5_000, // 5s
        }
    }
}

impl HealthConfig {
    /// Degraded latency threshold as Duration
    #[must_use]
    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breaker tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// First cooldown after opening
    pub base_cooldown_ms: u64,
    /// Cooldown multiplier applied when a half-open trial fails
    pub backoff_multiplier: f64,
    /// Cooldown ceiling
    pub max_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown_ms: 30_000, // 30s
            backoff_multiplier: 2.0,
            max_cooldown_ms: 300_000, // 5min
        }
    }
}

impl CircuitBreakerConfig {
    /// Base cooldown as Duration
    #[must_use]
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.base_cooldown_ms)
    }

    /// Max cooldown as Duration
    #[must_use]
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    /// Cooldown that follows `current` after a failed trial
    #[must_use]
    pub fn next_cooldown(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next_ms.min(self.max_cooldown_ms))
    }
}

// ============================================================================
// Failover
// ============================================================================

/// How a failed streaming attempt is handled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFailoverMode {
    /// Only the first admitted candidate is tried
    Disabled,
    /// Restart on the next candidate; chunks already emitted stay emitted
    #[default]
    Restart,
    /// Buffer each attempt and emit only the successful one
    BufferedRestart,
}

impl std::str::FromStr for StreamFailoverMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "restart" => Ok(Self::Restart),
            "buffered_restart" | "buffered" => Ok(Self::BufferedRestart),
            other => Err(ConfigError::Validation(format!(
                "unknown stream failover mode '{other}'"
            ))),
        }
    }
}

/// Failover sequencing policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Maximum backends actually called per request
    pub max_retries: u32,
    /// Timeout for a single attempt
    pub attempt_timeout_ms: u64,
    /// Whether circuit-open skips use up a retry
    pub count_circuit_skips: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout_ms: 60_000, // 1min
            count_circuit_skips: false,
        }
    }
}

impl FailoverConfig {
    /// Attempt timeout as Duration
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Background probe settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Timeout for a single probe
    pub probe_timeout_ms: u64,
    /// Prompt sent as the synthetic probe request
    pub probe_prompt: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000, // 10s
            probe_prompt: "ping".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Probe timeout as Duration
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// Top Level
// ============================================================================

/// Complete orchestrator configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Strategy used when a request does not name one
    pub default_strategy: SelectionStrategy,
    /// Streaming failover behavior
    pub stream_failover: StreamFailoverMode,
    /// Health thresholds
    pub health: HealthConfig,
    /// Circuit breaker tuning
    pub circuit_breaker: CircuitBreakerConfig,
    /// Failover policy
    pub failover: FailoverConfig,
    /// Health monitor settings
    pub monitor: MonitorConfig,
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ORCHESTRATOR_*` environment overrides
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("ORCHESTRATOR_MAX_RETRIES") {
            self.failover.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("ORCHESTRATOR_ATTEMPT_TIMEOUT_MS") {
            self.failover.attempt_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("ORCHESTRATOR_UNHEALTHY_THRESHOLD") {
            self.health.unhealthy_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("ORCHESTRATOR_DEGRADED_LATENCY_MS") {
            self.health.degraded_latency_ms = v;
        }
        if let Some(v) = env_parse::<u32>("ORCHESTRATOR_BREAKER_THRESHOLD") {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("ORCHESTRATOR_BREAKER_COOLDOWN_MS") {
            self.circuit_breaker.base_cooldown_ms = v;
        }
        if let Some(v) = env_parse::<SelectionStrategy>("ORCHESTRATOR_DEFAULT_STRATEGY") {
            self.default_strategy = v;
        }
        if let Some(v) = env_parse::<StreamFailoverMode>("ORCHESTRATOR_STREAM_FAILOVER") {
            self.stream_failover = v;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.unhealthy_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        let multiplier = self.circuit_breaker.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "circuit_breaker.backoff_multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }
        if self.circuit_breaker.max_cooldown_ms < self.circuit_breaker.base_cooldown_ms {
            return Err(ConfigError::Validation(
                "circuit_breaker.max_cooldown_ms must be >= base_cooldown_ms".into(),
            ));
        }
        if self.failover.max_retries == 0 {
            return Err(ConfigError::Validation(
                "failover.max_retries must be at least 1".into(),
            ));
        }
        if self.failover.attempt_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "failover.attempt_timeout_ms must be positive".into(),
            ));
        }
        if self.monitor.probe_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "monitor.probe_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => {
            tracing::debug!(key, value = %raw, "applied environment override");
            Some(value)
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
