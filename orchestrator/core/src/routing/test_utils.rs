//! Test utilities for routing
//!
//! A scripted backend whose behavior tests can switch at runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendError, BackendHandle, BackendResponse, ChatRequest, EmbeddingResponse, TokenUsage,
};

/// What the scripted backend does on each call
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Return a response
    Succeed,
    /// Return `Unavailable` with this message
    Fail(String),
    /// Fail this many times, then succeed
    FailTimes(usize),
    /// Never return until cancelled
    Hang,
}

/// Backend driven by a script
pub struct ScriptedBackend {
    name: String,
    behavior: Mutex<Behavior>,
    latency: Mutex<Duration>,
    usage: TokenUsage,
    chunks: Vec<String>,
    fail_after_chunks: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn with_behavior(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior: Mutex::new(behavior),
            latency: Mutex::new(Duration::ZERO),
            usage: TokenUsage::new(10, 20),
            chunks: vec!["hello".to_string(), " world".to_string()],
            fail_after_chunks: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always succeeds
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::with_behavior(name, Behavior::Succeed)
    }

    /// Always fails
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_behavior(name, Behavior::Fail(message.into()))
    }

    /// Never answers
    pub fn hanging(name: impl Into<String>) -> Self {
        Self::with_behavior(name, Behavior::Hang)
    }

    /// Set reported usage
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = TokenUsage::new(input, output);
        self
    }

    /// Set streamed chunks
    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Streaming fails after emitting this many chunks
    pub fn failing_stream_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// Delay every call
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Backend name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change behavior
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Calls received so far, including streaming, embedding and probes
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn run_script(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }

        let behavior = {
            let mut behavior = self.behavior.lock();
            let current = behavior.clone();
            if let Behavior::FailTimes(n) = current {
                *behavior = if n <= 1 {
                    Behavior::Succeed
                } else {
                    Behavior::FailTimes(n - 1)
                };
            }
            current
        };

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => Err(BackendError::Unavailable(message)),
            Behavior::FailTimes(_) => Err(BackendError::Unavailable("scripted failure".into())),
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl BackendHandle for ScriptedBackend {
    async fn call(
        &self,
        _request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError> {
        self.run_script(cancel).await?;
        let mut response = BackendResponse::new(self.chunks.concat(), self.usage);
        response.model = Some(self.name.clone());
        Ok(response)
    }

    async fn call_streaming(
        &self,
        _request: &ChatRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError> {
        self.run_script(cancel).await?;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if self.fail_after_chunks == Some(i) {
                return Err(BackendError::Unavailable("stream interrupted".into()));
            }
            on_chunk(chunk);
        }
        Ok(BackendResponse::new(self.chunks.concat(), self.usage))
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<EmbeddingResponse, BackendError> {
        self.run_script(cancel).await?;
        Ok(EmbeddingResponse {
            embeddings: texts.iter().map(|t| vec![t.len() as f32; 3]).collect(),
            usage: TokenUsage::new(self.usage.input_tokens, 0),
        })
    }
}
