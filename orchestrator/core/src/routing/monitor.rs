//! Active Health Monitor
//!
//! Periodically probes every enabled backend with a minimal synthetic request
//! and feeds the result into the [`HealthTracker`], so health stays current
//! even when traffic is idle.
//!
//! Probes in one round run concurrently, each under its own timeout, and each
//! result is recorded as soon as it arrives. A hung probe therefore delays
//! nothing but itself. Probe usage is not charged to the ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::MonitorConfig;
use super::health::HealthTracker;
use super::registry::{ProviderRegistry, RegisteredBackend};
use crate::backend::{BackendError, BackendResponse, ChatRequest};

type ProbeResult = (
    Arc<RegisteredBackend>,
    Result<Result<BackendResponse, BackendError>, tokio::time::error::Elapsed>,
    Duration,
);

/// Handle to a running probe loop
///
/// Dropping the handle cancels the loop; [`stop`](Self::stop) also waits
/// for it to exit.
#[derive(Debug)]
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl HealthMonitor {
    /// Spawn the probe loop on the current runtime
    pub fn start(
        interval: Duration,
        config: MonitorConfig,
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis() as u64, "health monitor started");

            loop {
                tokio::select! {
                    () = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                probe_round(&registry, &health, &config, &loop_cancel).await;
            }

            tracing::info!("health monitor stopped");
        });

        Self {
            cancel,
            task: Some(task),
            interval,
        }
    }

    /// Probe interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "health monitor task ended abnormally");
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn probe_round(
    registry: &ProviderRegistry,
    health: &HealthTracker,
    config: &MonitorConfig,
    cancel: &CancellationToken,
) {
    let backends = registry.list_enabled();
    if backends.is_empty() {
        return;
    }

    let request = Arc::new(ChatRequest::user(config.probe_prompt.clone()).with_max_tokens(1));
    let timeout = config.probe_timeout();
    let mut probes: JoinSet<ProbeResult> = JoinSet::new();

    for backend in backends {
        let request = Arc::clone(&request);
        let token = cancel.child_token();
        probes.spawn(async move {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, backend.handle().call(&request, &token)).await;
            if outcome.is_err() {
                token.cancel();
            }
            (backend, outcome, started.elapsed())
        });
    }

    loop {
        let joined = tokio::select! {
            () = cancel.cancelled() => {
                probes.abort_all();
                return;
            }
            joined = probes.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };

        let (backend, outcome, latency) = match joined {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "probe task failed");
                continue;
            }
        };
        let name = backend.name();
        // Unregistered mid-round; do not resurrect its record.
        if !registry.contains(name) {
            continue;
        }

        match outcome {
            Ok(Ok(_)) => {
                tracing::trace!(backend = %name, latency_ms = latency.as_millis() as u64, "probe ok");
                health.record_success(name, latency);
            }
            Ok(Err(BackendError::Cancelled)) if cancel.is_cancelled() => {}
            Ok(Err(err)) => {
                tracing::debug!(backend = %name, error = %err, "probe failed");
                health.record_failure(name, format!("probe failed: {err}"));
            }
            Err(_elapsed) => {
                tracing::debug!(backend = %name, "probe timed out");
                health.record_failure(
                    name,
                    format!("probe timed out after {}ms", timeout.as_millis()),
                );
            }
        }
    }
}
