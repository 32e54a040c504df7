//! Backend Selection
//!
//! Turns the registry plus current health into an ordered candidate list for
//! one request. Selection is a read-only pass except for the round-robin
//! cursor.
//!
//! # Filtering
//!
//! 1. Only enabled backends are considered.
//! 2. Backends lacking a required capability are dropped.
//! 3. Backends whose last observed latency exceeds `max_latency` are dropped
//!    (backends with no latency sample are kept).
//! 4. Unhealthy backends are dropped, unless that would leave nothing, in
//!    which case the filtered set is used as is. A last-ditch attempt beats a
//!    guaranteed failure.
//!
//! Ties in every ordering are broken by registration order.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::config::ConfigError;
use super::health::{HealthState, HealthTracker};
use super::registry::{Capabilities, Capability, Pricing, ProviderRegistry, RegisteredBackend};

/// Token estimate used by least-cost ordering when the request gives none
const DEFAULT_COST_ESTIMATE_TOKENS: u64 = 1_000;

// ============================================================================
// Strategy
// ============================================================================

/// How candidates are ordered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Ascending priority
    #[default]
    Priority,
    /// Ascending estimated cost, unpriced last
    LeastCost,
    /// Ascending last latency, unmeasured last
    FastestResponse,
    /// Rotate the starting backend on every request
    RoundRobin,
    /// Uniform shuffle
    Random,
    /// Only the backend named in the context
    Specific,
    /// Caller-supplied ordering function
    Custom,
}

impl SelectionStrategy {
    /// Snake-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::LeastCost => "least_cost",
            Self::FastestResponse => "fastest_response",
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Specific => "specific",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "priority" => Ok(Self::Priority),
            "least_cost" => Ok(Self::LeastCost),
            "fastest_response" | "fastest" => Ok(Self::FastestResponse),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "specific" => Ok(Self::Specific),
            "custom" => Ok(Self::Custom),
            other => Err(ConfigError::Validation(format!(
                "unknown selection strategy '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Candidate Views and Context
// ============================================================================

/// Read-only view of a candidate, handed to custom ordering functions
#[derive(Clone, Debug, PartialEq)]
pub struct BackendView {
    /// Backend name
    pub name: String,
    /// Priority at selection time
    pub priority: i32,
    /// Prices, if any
    pub pricing: Option<Pricing>,
    /// Features
    pub capabilities: Capabilities,
    /// Health at selection time
    pub health: HealthState,
    /// Last successful latency
    pub last_latency: Option<Duration>,
    /// Registration order
    pub registration_seq: u64,
}

/// Caller-supplied ordering: returns backend names, best first
///
/// Names that are not in the input are ignored, as are duplicates.
pub type CustomOrdering = Arc<dyn Fn(&[BackendView]) -> Vec<String> + Send + Sync>;

/// Per-request selection inputs
#[derive(Clone, Default)]
pub struct SelectionContext {
    /// Overrides the orchestrator's default strategy
    pub strategy: Option<SelectionStrategy>,
    /// Backend for the `Specific` strategy
    pub backend: Option<String>,
    /// Drop backends whose last latency exceeds this
    pub max_latency: Option<Duration>,
    /// Capability the request needs
    pub required_capability: Option<Capability>,
    /// Input tokens assumed by least-cost ordering
    pub estimated_input_tokens: u64,
    /// Output tokens assumed by least-cost ordering
    pub estimated_output_tokens: u64,
    /// Ordering for the `Custom` strategy, overriding the orchestrator's
    pub custom_ordering: Option<CustomOrdering>,
}

impl fmt::Debug for SelectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionContext")
            .field("strategy", &self.strategy)
            .field("backend", &self.backend)
            .field("max_latency", &self.max_latency)
            .field("required_capability", &self.required_capability)
            .field("estimated_input_tokens", &self.estimated_input_tokens)
            .field("estimated_output_tokens", &self.estimated_output_tokens)
            .field("custom_ordering", &self.custom_ordering.is_some())
            .finish()
    }
}

impl SelectionContext {
    /// Empty context: default strategy, no constraints
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific strategy
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Route to exactly this backend
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.strategy = Some(SelectionStrategy::Specific);
        self.backend = Some(backend.into());
        self
    }

    /// Latency ceiling
    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = Some(max_latency);
        self
    }

    /// Require a capability
    pub fn requiring(mut self, capability: Capability) -> Self {
        self.required_capability = Some(capability);
        self
    }

    /// Token estimate for least-cost ordering
    pub fn with_token_estimate(mut self, input: u64, output: u64) -> Self {
        self.estimated_input_tokens = input;
        self.estimated_output_tokens = output;
        self
    }

    /// Order with a custom function
    pub fn with_custom_ordering(mut self, ordering: CustomOrdering) -> Self {
        self.strategy = Some(SelectionStrategy::Custom);
        self.custom_ordering = Some(ordering);
        self
    }
}

// ============================================================================
// Selector
// ============================================================================

struct Candidate {
    backend: Arc<RegisteredBackend>,
    view: BackendView,
}

/// Produces ordered candidate lists
#[derive(Default)]
pub struct Selector {
    round_robin: AtomicUsize,
    custom: RwLock<Option<CustomOrdering>>,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("round_robin", &self.round_robin.load(Ordering::Relaxed))
            .field("custom", &self.custom.read().is_some())
            .finish()
    }
}

impl Selector {
    /// Create a selector
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the default ordering for the `Custom` strategy
    pub fn set_custom_ordering(&self, ordering: CustomOrdering) {
        *self.custom.write() = Some(ordering);
    }

    /// Ordered candidates for a request
    ///
    /// `required` lists capabilities implied by the request itself, in
    /// addition to the one in the context.
    pub fn select(
        &self,
        strategy: SelectionStrategy,
        context: &SelectionContext,
        required: &[Capability],
        registry: &ProviderRegistry,
        health: &HealthTracker,
    ) -> Vec<Arc<RegisteredBackend>> {
        let mut required = required.to_vec();
        if let Some(capability) = context.required_capability {
            if !required.contains(&capability) {
                required.push(capability);
            }
        }

        if strategy == SelectionStrategy::Specific {
            return Self::select_specific(context, &required, registry);
        }

        let filtered: Vec<Candidate> = registry
            .list_enabled()
            .into_iter()
            .filter(|b| b.capabilities().supports_all(&required))
            .map(|backend| {
                let status = health.status(backend.name());
                let view = BackendView {
                    name: backend.name().to_string(),
                    priority: backend.priority(),
                    pricing: backend.pricing(),
                    capabilities: backend.capabilities(),
                    health: status.state,
                    last_latency: status.last_latency,
                    registration_seq: backend.registration_seq(),
                };
                Candidate { backend, view }
            })
            .filter(|c| match (context.max_latency, c.view.last_latency) {
                (Some(max), Some(latency)) => latency <= max,
                _ => true,
            })
            .collect();

        let (eligible, ineligible): (Vec<_>, Vec<_>) = filtered
            .into_iter()
            .partition(|c| c.view.health.is_eligible());
        let mut pool = if eligible.is_empty() && !ineligible.is_empty() {
            tracing::debug!(
                count = ineligible.len(),
                "no healthy candidates, falling back to unhealthy backends"
            );
            ineligible
        } else {
            eligible
        };

        match strategy {
            SelectionStrategy::Priority | SelectionStrategy::Specific => {
                Self::order_by_priority(&mut pool);
            }
            SelectionStrategy::LeastCost => Self::order_by_cost(&mut pool, context),
            SelectionStrategy::FastestResponse => {
                pool.sort_by(|a, b| {
                    compare_missing_last(a.view.last_latency, b.view.last_latency, Ord::cmp)
                        .then(a.view.registration_seq.cmp(&b.view.registration_seq))
                });
            }
            SelectionStrategy::RoundRobin => {
                if !pool.is_empty() {
                    let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % pool.len();
                    pool.rotate_left(start);
                }
            }
            SelectionStrategy::Random => pool.shuffle(&mut rand::thread_rng()),
            SelectionStrategy::Custom => {
                let ordering = context
                    .custom_ordering
                    .clone()
                    .or_else(|| self.custom.read().clone());
                match ordering {
                    Some(ordering) => pool = Self::order_custom(pool, &ordering),
                    None => {
                        tracing::warn!("custom strategy without an ordering function, using priority");
                        Self::order_by_priority(&mut pool);
                    }
                }
            }
        }

        pool.into_iter().map(|c| c.backend).collect()
    }

    fn select_specific(
        context: &SelectionContext,
        required: &[Capability],
        registry: &ProviderRegistry,
    ) -> Vec<Arc<RegisteredBackend>> {
        let Some(name) = context.backend.as_deref() else {
            return Vec::new();
        };
        match registry.get(name) {
            Ok(backend)
                if backend.is_enabled() && backend.capabilities().supports_all(required) =>
            {
                vec![backend]
            }
            _ => Vec::new(),
        }
    }

    fn order_by_priority(pool: &mut [Candidate]) {
        pool.sort_by_key(|c| (c.view.priority, c.view.registration_seq));
    }

    fn order_by_cost(pool: &mut [Candidate], context: &SelectionContext) {
        let (input, output) =
            if context.estimated_input_tokens == 0 && context.estimated_output_tokens == 0 {
                (DEFAULT_COST_ESTIMATE_TOKENS, DEFAULT_COST_ESTIMATE_TOKENS)
            } else {
                (context.estimated_input_tokens, context.estimated_output_tokens)
            };
        pool.sort_by(|a, b| {
            let cost_a = a.view.pricing.map(|p| p.cost(input, output));
            let cost_b = b.view.pricing.map(|p| p.cost(input, output));
            compare_missing_last(cost_a, cost_b, f64::total_cmp)
                .then(a.view.registration_seq.cmp(&b.view.registration_seq))
        });
    }

    fn order_custom(pool: Vec<Candidate>, ordering: &CustomOrdering) -> Vec<Candidate> {
        let views: Vec<BackendView> = pool.iter().map(|c| c.view.clone()).collect();
        let names = ordering(&views);

        let mut remaining: Vec<Option<Candidate>> = pool.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in names {
            if let Some(slot) = remaining
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|c| c.view.name == name))
            {
                if let Some(candidate) = slot.take() {
                    ordered.push(candidate);
                }
            }
        }
        ordered
    }
}

fn compare_missing_last<T: Copy>(
    a: Option<T>,
    b: Option<T>,
    cmp: impl Fn(&T, &T) -> CmpOrdering,
) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(&a, &b),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}
