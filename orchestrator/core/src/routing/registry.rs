//! Backend Registry
//!
//! Named set of backends with their routing metadata. Names are unique;
//! registration order is remembered and used as the final tie-breaker by
//! every selection strategy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::BackendHandle;
use crate::error::{OrchestratorError, Result};

// ============================================================================
// Metadata
// ============================================================================

/// Per-1K-token prices in USD
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 1000 input tokens
    pub input_per_1k: f64,
    /// Price per 1000 output tokens
    pub output_per_1k: f64,
}

impl Pricing {
    /// Create a price table
    #[must_use]
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Cost of a call in USD
    #[must_use]
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// A feature a request may require
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Incremental output
    Streaming,
    /// Embedding vectors
    Embeddings,
    /// Tool calling
    Tools,
    /// Image input
    Vision,
}

/// What a backend can do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Supports streaming
    pub streaming: bool,
    /// Supports embeddings
    pub embeddings: bool,
    /// Supports tool calls
    pub tools: bool,
    /// Accepts images
    pub vision: bool,
    /// Output token ceiling, if any
    pub max_tokens: Option<u32>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            embeddings: false,
            tools: false,
            vision: false,
            max_tokens: None,
        }
    }
}

impl Capabilities {
    /// Whether the capability is present
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Streaming => self.streaming,
            Capability::Embeddings => self.embeddings,
            Capability::Tools => self.tools,
            Capability::Vision => self.vision,
        }
    }

    /// Whether every listed capability is present
    #[must_use]
    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.supports(*c))
    }
}

/// Routing metadata supplied at registration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendMetadata {
    /// Lower values are preferred
    pub priority: i32,
    /// Disabled backends are never selected
    pub enabled: bool,
    /// Per-1K-token prices; unpriced backends cost nothing
    pub pricing: Option<Pricing>,
    /// Supported features
    pub capabilities: Capabilities,
}

impl Default for BackendMetadata {
    fn default() -> Self {
        Self {
            priority: 100,
            enabled: true,
            pricing: None,
            capabilities: Capabilities::default(),
        }
    }
}

impl BackendMetadata {
    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set pricing
    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.pricing = Some(Pricing::new(input_per_1k, output_per_1k));
        self
    }

    /// Set capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Start disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// Registered Backend
// ============================================================================

#[derive(Debug)]
struct MutableMetadata {
    priority: i32,
    enabled: bool,
}

/// A backend as held by the registry
pub struct RegisteredBackend {
    name: String,
    handle: Arc<dyn BackendHandle>,
    pricing: Option<Pricing>,
    capabilities: Capabilities,
    registration_seq: u64,
    state: RwLock<MutableMetadata>,
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RegisteredBackend")
            .field("name", &self.name)
            .field("priority", &state.priority)
            .field("enabled", &state.enabled)
            .field("pricing", &self.pricing)
            .field("registration_seq", &self.registration_seq)
            .finish_non_exhaustive()
    }
}

impl RegisteredBackend {
    /// Unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The provider implementation
    pub fn handle(&self) -> &Arc<dyn BackendHandle> {
        &self.handle
    }

    /// Prices, if configured
    pub fn pricing(&self) -> Option<Pricing> {
        self.pricing
    }

    /// Supported features
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Monotonic registration order
    pub fn registration_seq(&self) -> u64 {
        self.registration_seq
    }

    /// Current priority
    pub fn priority(&self) -> i32 {
        self.state.read().priority
    }

    /// Whether currently enabled
    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    /// Metadata as currently configured
    pub fn metadata(&self) -> BackendMetadata {
        let state = self.state.read();
        BackendMetadata {
            priority: state.priority,
            enabled: state.enabled,
            pricing: self.pricing,
            capabilities: self.capabilities,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Concurrent name -> backend map
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    backends: DashMap<String, Arc<RegisteredBackend>>,
    next_seq: AtomicU64,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend under a unique name
    pub fn register(
        &self,
        name: impl Into<String>,
        handle: Arc<dyn BackendHandle>,
        metadata: BackendMetadata,
    ) -> Result<Arc<RegisteredBackend>> {
        let name = name.into();
        match self.backends.entry(name.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::DuplicateBackend(name)),
            Entry::Vacant(slot) => {
                let backend = Arc::new(RegisteredBackend {
                    name,
                    handle,
                    pricing: metadata.pricing,
                    capabilities: metadata.capabilities,
                    registration_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    state: RwLock::new(MutableMetadata {
                        priority: metadata.priority,
                        enabled: metadata.enabled,
                    }),
                });
                slot.insert(Arc::clone(&backend));
                Ok(backend)
            }
        }
    }

    /// Remove a backend
    pub fn unregister(&self, name: &str) -> Result<Arc<RegisteredBackend>> {
        self.backends
            .remove(name)
            .map(|(_, backend)| backend)
            .ok_or_else(|| OrchestratorError::BackendNotFound(name.to_string()))
    }

    /// Look up a backend
    pub fn get(&self, name: &str) -> Result<Arc<RegisteredBackend>> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::BackendNotFound(name.to_string()))
    }

    /// Whether a backend is registered
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Enable or disable a backend
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.get(name)?.state.write().enabled = enabled;
        Ok(())
    }

    /// Change a backend's priority
    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.get(name)?.state.write().priority = priority;
        Ok(())
    }

    /// Enabled backends in registration order
    pub fn list_enabled(&self) -> Vec<Arc<RegisteredBackend>> {
        let mut enabled: Vec<_> = self
            .backends
            .iter()
            .filter(|entry| entry.value().is_enabled())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        enabled.sort_by_key(|b| b.registration_seq);
        enabled
    }

    /// All backends in registration order
    pub fn list_all(&self) -> Vec<Arc<RegisteredBackend>> {
        let mut all: Vec<_> = self
            .backends
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by_key(|b| b.registration_seq);
        all
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
