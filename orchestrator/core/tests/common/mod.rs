//! Shared mock backend for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    BackendError, BackendHandle, BackendMetadata, BackendResponse, ChatRequest, Orchestrator,
    TokenUsage,
};
use tokio_util::sync::CancellationToken;

/// How the mock answers
#[derive(Clone, Copy, Debug)]
pub enum Mode {
    Succeed,
    Fail,
    Hang,
}

/// Backend with a fixed answer mode and a call counter
pub struct MockBackend {
    name: String,
    mode: Mode,
    usage: TokenUsage,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(name: &str, mode: Mode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            usage: TokenUsage::new(100, 50),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = TokenUsage::new(input, output);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendHandle for MockBackend {
    async fn call(
        &self,
        _request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        match self.mode {
            Mode::Succeed => Ok(BackendResponse::new(
                format!("answer from {}", self.name),
                self.usage,
            )),
            Mode::Fail => Err(BackendError::Unavailable(format!("{} is down", self.name))),
            Mode::Hang => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
        }
    }
}

/// Register a mock and keep a handle for assertions
pub fn add(orchestrator: &Orchestrator, backend: MockBackend, metadata: BackendMetadata) -> Arc<MockBackend> {
    let backend = Arc::new(backend);
    orchestrator
        .register_backend(backend.name.clone(), backend.clone(), metadata)
        .expect("register backend");
    backend
}
