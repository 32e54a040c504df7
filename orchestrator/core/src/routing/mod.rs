//! Provider Routing
//!
//! Registry, health, circuit breaking, cost accounting, selection and
//! failover for a set of interchangeable provider backends.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   Orchestrator   |  <-- Entry point for all requests
//! +--------+---------+
//!          |
//!          v
//! +------------------+       +------------------+
//! |     Selector     | <---- | ProviderRegistry |
//! +--------+---------+       +------------------+
//!          |                          ^
//!          v                          |
//! +------------------+       +------------------+
//! |FailoverSequencer | ----> |  HealthTracker   | <-- HealthMonitor probes
//! +--------+---------+       +------------------+
//!          |          \
//!          v           \---> +------------------+
//! +------------------+       |  CircuitBreaker  |
//! |    CostLedger    |       +------------------+
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Per-backend state**: every "name -> record" map is a `DashMap` with a
//!    lock per record, so unrelated backends never contend
//! 2. **Graceful degradation**: unhealthy backends are avoided, not banned
//! 3. **Cancellation wins**: a cancelled request stops at once and blames no one
//! 4. **Explicit composition**: each stage is usable and testable on its own

pub mod circuit_breaker;
pub mod config;
pub mod failover;
pub mod health;
pub mod ledger;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod stats;

#[cfg(test)]
pub mod test_utils;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use config::*;
pub use failover::{AttemptSuccess, FailoverOutcome, FailoverSequencer};
pub use health::{AggregateHealthStats, HealthState, HealthStatus, HealthTracker};
pub use ledger::{
    AlertCallback, BackendUsage, BudgetAlert, BudgetCheck, BudgetEnforcement, BudgetPeriod,
    BudgetScope, BudgetStatus, Clock, CostLedger, ManualClock, SystemClock,
};
pub use monitor::HealthMonitor;
pub use orchestrator::{EmbedResponse, Orchestrator, SendResponse};
pub use registry::{
    BackendMetadata, Capabilities, Capability, Pricing, ProviderRegistry, RegisteredBackend,
};
pub use selector::{BackendView, CustomOrdering, SelectionContext, SelectionStrategy, Selector};
pub use stats::{OrchestratorStats, StatsSnapshot};
