//! Orchestrator Facade
//!
//! The single entry point callers use. Composes the pipeline explicitly:
//!
//! ```text
//!   send / send_streaming / embed
//!              |
//!              v
//!   global budget check ----------------> BudgetExceeded
//!              |
//!              v
//!   Selector (registry + health) -------> NoEligibleBackend
//!              |
//!              v
//!   FailoverSequencer
//!     per candidate: budget -> breaker -> call (timeout, cancel)
//!     outcome -> HealthTracker, CircuitBreaker, CostLedger
//!              |
//!              v
//!   response | AllBackendsExhausted | Cancelled
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use super::config::{FailoverConfig, OrchestratorConfig, StreamFailoverMode};
use super::failover::{AttemptSuccess, FailoverOutcome, FailoverSequencer};
use super::health::{HealthStatus, HealthTracker};
use super::ledger::{
    AlertCallback, BackendUsage, BudgetCheck, BudgetEnforcement, BudgetPeriod, BudgetScope,
    BudgetStatus, Clock, CostLedger, SystemClock,
};
use super::monitor::HealthMonitor;
use super::registry::{BackendMetadata, Capability, ProviderRegistry};
use super::selector::{CustomOrdering, SelectionContext, SelectionStrategy, Selector};
use super::stats::{OrchestratorStats, StatsSnapshot};
use crate::backend::{BackendError, BackendHandle, ChatRequest, ChunkCallback, TokenUsage};
use crate::error::{AttemptError, OrchestratorError, Result};
use crate::routing::config::ConfigError;

// ============================================================================
// Responses
// ============================================================================

/// Successful chat response
#[derive(Clone, Debug)]
pub struct SendResponse {
    /// Id attached to this request's log span
    pub request_id: Uuid,
    /// Generated text
    pub content: String,
    /// Model reported by the backend
    pub model: Option<String>,
    /// Backend that answered
    pub backend: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Cost in USD
    pub cost: f64,
    /// Latency of the successful attempt
    pub latency: Duration,
    /// Candidates that failed or were skipped first
    pub failed_attempts: Vec<AttemptError>,
}

/// Successful embeddings response
#[derive(Clone, Debug)]
pub struct EmbedResponse {
    /// Id attached to this request's log span
    pub request_id: Uuid,
    /// One vector per input text
    pub embeddings: Vec<Vec<f32>>,
    /// Backend that answered
    pub backend: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Cost in USD
    pub cost: f64,
    /// Candidates that failed or were skipped first
    pub failed_attempts: Vec<AttemptError>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Routes requests across registered backends
pub struct Orchestrator {
    config: OrchestratorConfig,
    default_strategy: RwLock<SelectionStrategy>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<CostLedger>,
    stats: Arc<OrchestratorStats>,
    selector: Selector,
    sequencer: FailoverSequencer,
    monitor: tokio::sync::Mutex<Option<HealthMonitor>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backends", &self.registry.len())
            .field("default_strategy", &*self.default_strategy.read())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator using the system clock
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an orchestrator with an injected clock for budget periods
    pub fn with_clock(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        let health = Arc::new(HealthTracker::new(config.health.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let ledger = Arc::new(CostLedger::new(clock));
        let stats = Arc::new(OrchestratorStats::new());
        let sequencer = FailoverSequencer::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&breaker),
            Arc::clone(&ledger),
            Arc::clone(&stats),
        );

        Ok(Self {
            default_strategy: RwLock::new(config.default_strategy),
            config,
            registry,
            health,
            breaker,
            ledger,
            stats,
            selector: Selector::new(),
            sequencer,
            monitor: tokio::sync::Mutex::new(None),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a backend under a unique name
    pub fn register_backend(
        &self,
        name: impl Into<String>,
        handle: Arc<dyn BackendHandle>,
        metadata: BackendMetadata,
    ) -> Result<()> {
        let pricing = metadata.pricing;
        let backend = self.registry.register(name, handle, metadata)?;
        self.ledger.set_pricing(backend.name(), pricing);
        tracing::info!(
            backend = %backend.name(),
            priority = backend.priority(),
            enabled = backend.is_enabled(),
            "backend registered"
        );
        Ok(())
    }

    /// Remove a backend and its health and breaker state
    ///
    /// Cost history is kept for reporting.
    pub fn unregister_backend(&self, name: &str) -> Result<()> {
        self.registry.unregister(name)?;
        self.ledger.set_pricing(name, None);
        self.health.remove(name);
        self.breaker.remove(name);
        tracing::info!(backend = %name, "backend unregistered");
        Ok(())
    }

    /// Enable or disable a backend
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name, enabled)?;
        tracing::info!(backend = %name, enabled, "backend availability changed");
        Ok(())
    }

    /// Change a backend's priority
    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.registry.set_priority(name, priority)
    }

    /// Registered backend names in registration order
    pub fn backend_names(&self) -> Vec<String> {
        self.registry
            .list_all()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Strategy
    // ------------------------------------------------------------------------

    /// Strategy used when a request does not name one
    pub fn set_default_strategy(&self, strategy: SelectionStrategy) {
        *self.default_strategy.write() = strategy;
    }

    /// Current default strategy
    pub fn default_strategy(&self) -> SelectionStrategy {
        *self.default_strategy.read()
    }

    /// Ordering used by the `Custom` strategy when the request has none
    pub fn set_custom_ordering(&self, ordering: CustomOrdering) {
        self.selector.set_custom_ordering(ordering);
    }

    // ------------------------------------------------------------------------
    // Budgets and cost
    // ------------------------------------------------------------------------

    /// Set a soft (alert-only) budget
    pub fn set_budget(&self, scope: impl Into<BudgetScope>, limit: f64, period: BudgetPeriod) {
        self.set_budget_with_enforcement(scope, limit, period, BudgetEnforcement::Soft);
    }

    /// Set a budget with explicit enforcement
    pub fn set_budget_with_enforcement(
        &self,
        scope: impl Into<BudgetScope>,
        limit: f64,
        period: BudgetPeriod,
        enforcement: BudgetEnforcement,
    ) {
        self.ledger.set_budget(scope.into(), limit, period, enforcement);
    }

    /// Add a threshold alert to an existing budget
    pub fn add_budget_alert(
        &self,
        scope: impl Into<BudgetScope>,
        threshold_percent: f64,
        message: impl Into<String>,
    ) -> Result<()> {
        let scope = scope.into();
        if !(threshold_percent > 0.0 && threshold_percent.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "alert threshold must be a positive percentage, got {threshold_percent}"
            ))
            .into());
        }
        if self.ledger.add_alert(&scope, threshold_percent, message) {
            Ok(())
        } else {
            Err(ConfigError::Validation(format!("no budget set for {scope}")).into())
        }
    }

    /// Deliver budget alerts to a callback
    pub fn on_budget_alert(&self, callback: AlertCallback) {
        self.ledger.on_alert(callback);
    }

    /// Budget status for a scope
    pub fn budget_status(&self, scope: impl Into<BudgetScope>) -> Option<BudgetStatus> {
        self.ledger.budget_status(&scope.into())
    }

    /// Total cost for one backend, or all
    pub fn get_total_cost(&self, backend: Option<&str>) -> f64 {
        self.ledger.total_cost(backend)
    }

    /// Cost per backend
    pub fn get_cost_by_backend(&self) -> HashMap<String, f64> {
        self.ledger.cost_by_backend()
    }

    /// Usage per backend
    pub fn get_usage_by_backend(&self) -> HashMap<String, BackendUsage> {
        self.ledger.usage_by_backend()
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Start (or restart) background probing
    pub async fn start_health_monitoring(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ConfigError::Validation("monitor interval must be positive".into()).into());
        }
        let mut slot = self.monitor.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        *slot = Some(HealthMonitor::start(
            interval,
            self.config.monitor.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
        ));
        Ok(())
    }

    /// Stop background probing and wait for the loop to exit
    pub async fn stop_health_monitoring(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    /// Whether background probing is running
    pub async fn is_health_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(HealthMonitor::is_running)
    }

    /// Health of a registered backend
    pub fn get_health_status(&self, name: &str) -> Result<HealthStatus> {
        self.registry.get(name)?;
        Ok(self.health.status(name))
    }

    /// Health of every registered backend, in registration order
    pub fn get_all_health_statuses(&self) -> Vec<HealthStatus> {
        self.registry
            .list_all()
            .iter()
            .map(|b| self.health.status(b.name()))
            .collect()
    }

    /// Circuit breaker view of a registered backend
    pub fn circuit_status(&self, name: &str) -> Result<CircuitSnapshot> {
        self.registry.get(name)?;
        Ok(self.breaker.snapshot(name))
    }

    /// Close a backend's circuit and forget its failures
    pub fn reset_circuit(&self, name: &str) -> Result<()> {
        self.registry.get(name)?;
        self.breaker.reset(name);
        Ok(())
    }

    /// Request counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared health tracker
    pub fn health_tracker(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.health)
    }

    /// Shared circuit breaker
    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Shared ledger
    pub fn ledger(&self) -> Arc<CostLedger> {
        Arc::clone(&self.ledger)
    }

    // ------------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------------

    /// Send a chat request
    pub async fn send(
        &self,
        request: &ChatRequest,
        context: SelectionContext,
        cancel: &CancellationToken,
    ) -> Result<SendResponse> {
        let request_id = Uuid::new_v4();
        let context = with_request_estimates(context, request);
        let required = request_capabilities(request);

        let outcome = self
            .dispatch(
                "send",
                request_id,
                &context,
                &required,
                &self.config.failover,
                cancel,
                |backend, token| async move {
                    let response = backend.handle().call(request, &token).await?;
                    Ok::<_, BackendError>(AttemptSuccess {
                        usage: response.usage,
                        value: response,
                    })
                },
            )
            .await?;

        Ok(SendResponse {
            request_id,
            content: outcome.value.content,
            model: outcome.value.model,
            backend: outcome.backend,
            usage: outcome.usage,
            cost: outcome.cost,
            latency: outcome.latency,
            failed_attempts: outcome.failed_attempts,
        })
    }

    /// Send a chat request, forwarding chunks to `on_chunk`
    ///
    /// With [`StreamFailoverMode::Restart`] a failed attempt's chunks have
    /// already reached the caller when the next candidate starts over.
    /// [`StreamFailoverMode::BufferedRestart`] holds each attempt's chunks
    /// until it succeeds. [`StreamFailoverMode::Disabled`] tries one backend.
    pub async fn send_streaming(
        &self,
        request: &ChatRequest,
        context: SelectionContext,
        on_chunk: ChunkCallback,
        cancel: &CancellationToken,
    ) -> Result<SendResponse> {
        let request_id = Uuid::new_v4();
        let context = with_request_estimates(context, request);
        let mut required = request_capabilities(request);
        required.push(Capability::Streaming);

        let mode = self.config.stream_failover;
        let failover = match mode {
            StreamFailoverMode::Disabled => FailoverConfig {
                max_retries: 1,
                ..self.config.failover.clone()
            },
            StreamFailoverMode::Restart | StreamFailoverMode::BufferedRestart => {
                self.config.failover.clone()
            }
        };
        let on_chunk = &on_chunk;

        let outcome = self
            .dispatch(
                "send_streaming",
                request_id,
                &context,
                &required,
                &failover,
                cancel,
                |backend, token| async move {
                    let handle = backend.handle();
                    let response = if mode == StreamFailoverMode::BufferedRestart {
                        let buffer = Mutex::new(Vec::new());
                        let sink = |chunk: &str| buffer.lock().push(chunk.to_string());
                        let response = handle.call_streaming(request, &sink, &token).await?;
                        for chunk in buffer.into_inner() {
                            on_chunk(&chunk);
                        }
                        response
                    } else {
                        let emitted = AtomicUsize::new(0);
                        let sink = |chunk: &str| {
                            emitted.fetch_add(1, Ordering::Relaxed);
                            on_chunk(chunk);
                        };
                        match handle.call_streaming(request, &sink, &token).await {
                            Ok(response) => response,
                            Err(err) => {
                                let emitted = emitted.load(Ordering::Relaxed);
                                if emitted > 0 {
                                    tracing::warn!(
                                        backend = %backend.name(),
                                        chunks = emitted,
                                        "stream failed after partial output"
                                    );
                                }
                                return Err(err);
                            }
                        }
                    };
                    Ok::<_, BackendError>(AttemptSuccess {
                        usage: response.usage,
                        value: response,
                    })
                },
            )
            .await?;

        Ok(SendResponse {
            request_id,
            content: outcome.value.content,
            model: outcome.value.model,
            backend: outcome.backend,
            usage: outcome.usage,
            cost: outcome.cost,
            latency: outcome.latency,
            failed_attempts: outcome.failed_attempts,
        })
    }

    /// Embed texts with a backend that supports embeddings
    pub async fn embed(
        &self,
        texts: &[String],
        context: SelectionContext,
        cancel: &CancellationToken,
    ) -> Result<EmbedResponse> {
        let request_id = Uuid::new_v4();
        let mut context = context;
        if context.estimated_input_tokens == 0 {
            let chars: usize = texts.iter().map(String::len).sum();
            context.estimated_input_tokens = (chars as u64).div_ceil(4);
        }

        let outcome = self
            .dispatch(
                "embed",
                request_id,
                &context,
                &[Capability::Embeddings],
                &self.config.failover,
                cancel,
                |backend, token| async move {
                    let response = backend.handle().embed(texts, &token).await?;
                    Ok::<_, BackendError>(AttemptSuccess {
                        usage: response.usage,
                        value: response.embeddings,
                    })
                },
            )
            .await?;

        Ok(EmbedResponse {
            request_id,
            embeddings: outcome.value,
            backend: outcome.backend,
            usage: outcome.usage,
            cost: outcome.cost,
            failed_attempts: outcome.failed_attempts,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch<T, F, Fut>(
        &self,
        operation: &'static str,
        request_id: Uuid,
        context: &SelectionContext,
        required: &[Capability],
        failover: &FailoverConfig,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<FailoverOutcome<T>>
    where
        F: FnMut(Arc<super::registry::RegisteredBackend>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<AttemptSuccess<T>, BackendError>>,
    {
        let strategy = context.strategy.unwrap_or_else(|| self.default_strategy());
        let span = tracing::info_span!(
            "orchestrator.send",
            %request_id,
            operation,
            strategy = %strategy
        );

        self.stats.requests.inc();
        let result = self
            .route(strategy, context, required, failover, cancel, attempt)
            .instrument(span)
            .await;

        match &result {
            Ok(_) => self.stats.successes.inc(),
            Err(OrchestratorError::AllBackendsExhausted { .. }) => self.stats.exhausted.inc(),
            Err(OrchestratorError::Cancelled) => self.stats.cancelled.inc(),
            Err(_) => self.stats.rejected.inc(),
        }
        result
    }

    async fn route<T, F, Fut>(
        &self,
        strategy: SelectionStrategy,
        context: &SelectionContext,
        required: &[Capability],
        failover: &FailoverConfig,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<FailoverOutcome<T>>
    where
        F: FnMut(Arc<super::registry::RegisteredBackend>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<AttemptSuccess<T>, BackendError>>,
    {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        if let BudgetCheck::Exceeded { spent, limit } =
            self.ledger.check_budget(&BudgetScope::Global)
        {
            tracing::warn!(spent, limit, "global budget exhausted, rejecting request");
            return Err(OrchestratorError::BudgetExceeded {
                scope: BudgetScope::Global,
                spent,
                limit,
            });
        }

        let candidates =
            self.selector
                .select(strategy, context, required, &self.registry, &self.health);
        if candidates.is_empty() {
            tracing::warn!("no eligible backend");
            return Err(OrchestratorError::NoEligibleBackend {
                strategy: strategy.to_string(),
            });
        }
        tracing::debug!(
            candidates = ?candidates.iter().map(|b| b.name()).collect::<Vec<_>>(),
            "candidates selected"
        );

        let result = self
            .sequencer
            .execute(&candidates, failover, cancel, attempt)
            .await;

        match &result {
            Ok(outcome) => tracing::info!(
                backend = %outcome.backend,
                latency_ms = outcome.latency.as_millis() as u64,
                cost = outcome.cost,
                skipped_or_failed = outcome.failed_attempts.len(),
                "request completed"
            ),
            Err(OrchestratorError::Cancelled) => tracing::info!("request cancelled"),
            Err(err) => tracing::warn!(error = %err, "request failed"),
        }
        result
    }
}

fn with_request_estimates(mut context: SelectionContext, request: &ChatRequest) -> SelectionContext {
    if context.estimated_input_tokens == 0 {
        context.estimated_input_tokens = request.estimated_input_tokens();
    }
    if context.estimated_output_tokens == 0 {
        context.estimated_output_tokens = request.max_tokens.map_or(0, u64::from);
    }
    context
}

fn request_capabilities(request: &ChatRequest) -> Vec<Capability> {
    let mut required = Vec::new();
    if !request.tools.is_empty() {
        required.push(Capability::Tools);
    }
    if !request.images.is_empty() {
        required.push(Capability::Vision);
    }
    required
}
