//! Provider Backend Traits
//!
//! Trait definitions for provider backends. The orchestrator treats every
//! provider as an opaque [`BackendHandle`]: it knows how to call it, stream
//! from it, embed with it, and nothing more. Wire formats, authentication
//! and retry-after parsing are the implementation's business.
//!
//! # Cancellation
//!
//! Every call receives a [`CancellationToken`]. Implementations should stop
//! work and return [`BackendError::Cancelled`] once it fires. The orchestrator
//! also drops the in-flight future when the token fires, so a backend that
//! ignores the token is still abandoned, just less politely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Requests
// ============================================================================

/// Role of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// End user input
    User,
    /// Model output
    Assistant,
    /// Tool result
    Tool,
}

/// A single chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message with an explicit role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Requested output format
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free text
    #[default]
    Text,
    /// Any valid JSON object
    Json,
    /// JSON matching the given schema
    JsonSchema(serde_json::Value),
}

/// Tool the model may call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// What the tool does
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: serde_json::Value,
}

/// Image attached to a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    /// MIME type, e.g. `image/png`
    pub media_type: String,
    /// Base64 payload or URL
    pub data: String,
}

/// A chat request routed through the orchestrator
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Output format hint
    pub response_format: ResponseFormat,
    /// Tools offered to the model
    pub tools: Vec<ToolDefinition>,
    /// Attached images
    pub images: Vec<ImageInput>,
    /// Upper bound on output tokens
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Create a request from messages
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Single user message request
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(content)])
    }

    /// Set the response format
    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    /// Offer tools
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach images
    pub fn with_images(mut self, images: Vec<ImageInput>) -> Self {
        self.images = images;
        self
    }

    /// Set max output tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    /// Rough input token estimate (about four characters per token)
    #[must_use]
    pub fn estimated_input_tokens(&self) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (chars as u64).div_ceil(4)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Token counts reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Response from a chat call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Generated text
    pub content: String,
    /// Token usage for the call
    pub usage: TokenUsage,
    /// Model that produced the response, if the backend reports it
    pub model: Option<String>,
}

impl BackendResponse {
    /// Create a response with content and usage
    pub fn new(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
            model: None,
        }
    }
}

/// Response from an embeddings call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// One vector per input text
    pub embeddings: Vec<Vec<f32>>,
    /// Token usage for the call
    pub usage: TokenUsage,
}

/// Callback receiving streamed text chunks
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

/// Errors a backend may return
#[derive(Debug, Error)]
pub enum BackendError {
    /// Provider unreachable or returned a server error
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Provider throttled the request
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited {
        /// Provider hint, if any
        retry_after: Option<Duration>,
    },

    /// Backend-side timeout
    #[error("backend timed out")]
    Timeout,

    /// The call observed its cancellation token
    #[error("call cancelled")]
    Cancelled,

    /// The backend does not implement this operation
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A provider backend
///
/// Implement this trait to plug a provider into the orchestrator.
#[async_trait]
pub trait BackendHandle: Send + Sync {
    /// Send a chat request and wait for the complete response
    async fn call(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError>;

    /// Send a chat request, emitting text chunks as they arrive
    ///
    /// The returned response carries the full content and usage. The default
    /// implementation performs a regular call and emits the whole content as
    /// a single chunk.
    async fn call_streaming(
        &self,
        request: &ChatRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError> {
        let response = self.call(request, cancel).await?;
        on_chunk(&response.content);
        Ok(response)
    }

    /// Embed a batch of texts
    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<EmbeddingResponse, BackendError> {
        let _ = (texts, cancel);
        Err(BackendError::Unsupported("embeddings"))
    }
}
