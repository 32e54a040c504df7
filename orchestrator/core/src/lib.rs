//! Orchestrator Core - Provider Routing with Graceful Degradation
//!
//! This crate routes LLM requests across a set of interchangeable provider
//! backends. It decides which backend to try, in what order, and what to do
//! when one fails, while keeping track of health, circuit state and spend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Outer service layer                       │
//! │            (HTTP API, CLI, agents - not in this crate)        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ send / send_streaming / embed
//! ┌──────────────────────────────┼───────────────────────────────┐
//! │                      ORCHESTRATOR CORE                        │
//! │  ┌───────────────────────────┴───────────────────────────┐   │
//! │  │                      Orchestrator                      │   │
//! │  │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌────────┐ │   │
//! │  │  │ Selector │─▶│ Failover │─▶│  Ledger  │  │ Stats  │ │   │
//! │  │  └────┬─────┘  └────┬─────┘  └──────────┘  └────────┘ │   │
//! │  │       │             │                                  │   │
//! │  │  ┌────┴─────┐  ┌────┴─────┐  ┌──────────┐             │   │
//! │  │  │ Registry │  │  Health  │◀─│ Monitor  │             │   │
//! │  │  └──────────┘  │ Breaker  │  └──────────┘             │   │
//! │  │                └──────────┘                            │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ BackendHandle::call
//!                ┌───────────────┼───────────────┐
//!                ▼               ▼               ▼
//!           ┌─────────┐    ┌─────────┐    ┌─────────┐
//!           │Provider │    │Provider │    │  Local  │
//!           │    A    │    │    B    │    │  model  │
//!           └─────────┘    └─────────┘    └─────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use orchestrator_core::{
//!     BackendHandle, BackendMetadata, ChatRequest, Orchestrator, OrchestratorConfig,
//!     SelectionContext,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(primary: Arc<dyn BackendHandle>, fallback: Arc<dyn BackendHandle>) -> orchestrator_core::Result<()> {
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//! orchestrator.register_backend("primary", primary, BackendMetadata::default().with_priority(1))?;
//! orchestrator.register_backend("fallback", fallback, BackendMetadata::default().with_priority(2))?;
//!
//! let response = orchestrator
//!     .send(&ChatRequest::user("Hello"), SelectionContext::new(), &CancellationToken::new())
//!     .await?;
//! println!("{} answered: {}", response.backend, response.content);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod routing;

pub use backend::{
    BackendError, BackendHandle, BackendResponse, ChatMessage, ChatRequest, ChunkCallback,
    EmbeddingResponse, ImageInput, MessageRole, ResponseFormat, TokenUsage, ToolDefinition,
};
pub use error::{AttemptError, AttemptErrorKind, OrchestratorError, Result};
pub use routing::{
    BackendMetadata, BudgetAlert, BudgetEnforcement, BudgetPeriod, BudgetScope, Capabilities,
    Capability, CircuitState, ConfigError, EmbedResponse, HealthState, HealthStatus, Orchestrator,
    OrchestratorConfig, Pricing, SelectionContext, SelectionStrategy, SendResponse,
    StreamFailoverMode,
};

/// Filter used when `RUST_LOG` is unset or invalid
const DEFAULT_LOG_FILTER: &str = "orchestrator_core=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`
///
/// Falls back to `orchestrator_core=info` when `RUST_LOG` is unset. Returns
/// an error instead of panicking when a global subscriber is already
/// installed.
pub fn init_tracing() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rust_log = std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .try_init()
}

fn log_filter(rust_log: Option<&str>) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}
