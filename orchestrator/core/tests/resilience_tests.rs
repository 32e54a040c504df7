//! End-to-End Resilience Scenarios
//!
//! Drives the public `Orchestrator` API against mock backends and checks the
//! routing guarantees callers depend on: health thresholds, selection order,
//! circuit gating, failover, exhaustion, budget alerts and cancellation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{add, MockBackend, Mode};
use orchestrator_core::routing::{
    HealthTracker, ManualClock, ProviderRegistry, RegisteredBackend, Selector,
};
use orchestrator_core::{
    AttemptErrorKind, BackendMetadata, BudgetAlert, BudgetPeriod, ChatRequest, CircuitState,
    HealthState, Orchestrator, OrchestratorConfig, OrchestratorError, SelectionContext, SelectionStrategy,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(OrchestratorConfig::default()).expect("valid config")
}

fn names(backends: &[Arc<RegisteredBackend>]) -> Vec<String> {
    backends.iter().map(|b| b.name().to_string()).collect()
}

async fn send(orchestrator: &Orchestrator, context: SelectionContext) -> orchestrator_core::Result<String> {
    orchestrator
        .send(&ChatRequest::user("hello"), context, &CancellationToken::new())
        .await
        .map(|r| r.backend)
}

// ============================================================================
// Health
// ============================================================================

/// Exactly `unhealthy_threshold` consecutive failures mark a backend unhealthy
#[test]
fn test_health_threshold_marks_unhealthy() {
    let orch = orchestrator();
    let health = orch.health_tracker();
    let threshold = orch.config().health.unhealthy_threshold;

    for i in 1..threshold {
        health.record_failure("x", "down");
        assert_ne!(health.state("x"), HealthState::Unhealthy, "after {i} failures");
    }
    health.record_failure("x", "down");
    assert_eq!(health.state("x"), HealthState::Unhealthy);
}

/// One success after Unhealthy clears the failure streak
#[test]
fn test_health_recovers_on_single_success() {
    let orch = orchestrator();
    let health = orch.health_tracker();
    for _ in 0..3 {
        health.record_failure("x", "down");
    }

    health.record_success("x", Duration::from_millis(20));
    let status = health.status("x");
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.state, HealthState::Healthy);

    for _ in 0..3 {
        health.record_failure("x", "down");
    }
    health.record_success("x", Duration::from_secs(30));
    assert_eq!(health.state("x"), HealthState::Degraded);
}

// ============================================================================
// Selection
// ============================================================================

struct SelectionFixture {
    registry: ProviderRegistry,
    health: HealthTracker,
    selector: Selector,
}

impl SelectionFixture {
    fn new() -> Self {
        Self {
            registry: ProviderRegistry::new(),
            health: HealthTracker::default(),
            selector: Selector::new(),
        }
    }

    fn add(&self, name: &str, metadata: BackendMetadata) {
        self.registry
            .register(name, Arc::new(MockBackend::new(name, Mode::Succeed)), metadata)
            .unwrap();
    }

    fn select(&self, strategy: SelectionStrategy, context: &SelectionContext) -> Vec<String> {
        names(
            &self
                .selector
                .select(strategy, context, &[], &self.registry, &self.health),
        )
    }
}

/// Priority orders ascending and drops disabled backends
#[test]
fn test_priority_ordering() {
    let f = SelectionFixture::new();
    f.add("A", BackendMetadata::default().with_priority(1));
    f.add("B", BackendMetadata::default().with_priority(2));
    f.health.record_success("A", Duration::from_millis(10));
    f.health.record_success("B", Duration::from_millis(10));

    let ctx = SelectionContext::new();
    assert_eq!(f.select(SelectionStrategy::Priority, &ctx), vec!["A", "B"]);

    f.registry.set_enabled("A", false).unwrap();
    assert_eq!(f.select(SelectionStrategy::Priority, &ctx), vec!["B"]);
}

/// Least cost prefers the cheaper backend for equal token estimates
#[test]
fn test_least_cost_ordering() {
    let f = SelectionFixture::new();
    f.add("A", BackendMetadata::default().with_pricing(0.01, 0.03));
    f.add("B", BackendMetadata::default().with_pricing(0.003, 0.005));

    for (input, output) in [(0, 0), (500, 500), (10_000, 2_000)] {
        let ctx = SelectionContext::new().with_token_estimate(input, output);
        assert_eq!(f.select(SelectionStrategy::LeastCost, &ctx), vec!["B", "A"]);
    }
}

/// Three consecutive round-robin selections start at each backend once
#[test]
fn test_round_robin_fairness() {
    let f = SelectionFixture::new();
    for name in ["A", "B", "C"] {
        f.add(name, BackendMetadata::default());
    }

    let ctx = SelectionContext::new();
    let picks: Vec<Vec<String>> = (0..3)
        .map(|_| f.select(SelectionStrategy::RoundRobin, &ctx))
        .collect();

    assert_eq!(picks[0], vec!["A", "B", "C"]);
    assert_eq!(picks[1], vec!["B", "C", "A"]);
    assert_eq!(picks[2], vec!["C", "A", "B"]);
}

/// Concurrent round-robin callers never share a starting backend unfairly
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_is_fair_under_concurrency() {
    let orch = Arc::new(orchestrator());
    orch.set_default_strategy(SelectionStrategy::RoundRobin);
    let backends: Vec<_> = (0..5)
        .map(|i| {
            add(
                &orch,
                MockBackend::new(&format!("b{i}"), Mode::Succeed),
                BackendMetadata::default(),
            )
        })
        .collect();

    let requests = (0..50).map(|_| send(&orch, SelectionContext::new()));
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(Result::is_ok));
    for backend in &backends {
        assert_eq!(backend.calls(), 10);
    }
    assert_eq!(orch.stats().requests, 50);
    assert_eq!(orch.stats().successes, 50);
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// An open circuit keeps calls away from the backend until the cooldown passes
#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_gates_calls() {
    let mut config = OrchestratorConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.base_cooldown_ms = 1_000;
    let orch = Orchestrator::new(config).unwrap();

    let x = add(
        &orch,
        MockBackend::new("x", Mode::Fail),
        BackendMetadata::default().with_priority(1),
    );
    add(
        &orch,
        MockBackend::new("y", Mode::Succeed),
        BackendMetadata::default().with_priority(2),
    );

    assert_eq!(send(&orch, SelectionContext::new()).await.unwrap(), "y");
    assert_eq!(send(&orch, SelectionContext::new()).await.unwrap(), "y");
    assert_eq!(x.calls(), 2);
    assert!(!orch.circuit_breaker().is_call_allowed("x"));

    // Inside the cooldown: x is skipped without being called.
    let response = orch
        .send(&ChatRequest::user("hi"), SelectionContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.backend, "y");
    assert_eq!(response.failed_attempts[0].kind, AttemptErrorKind::CircuitOpen);
    assert_eq!(x.calls(), 2);

    // After the cooldown a single trial reaches x again.
    tokio::time::advance(Duration::from_millis(1_000)).await;
    send(&orch, SelectionContext::new()).await.unwrap();
    assert_eq!(x.calls(), 3);
}

// ============================================================================
// Failover
// ============================================================================

/// A failing primary falls through to the secondary
#[tokio::test]
async fn test_failover_end_to_end() {
    let mut config = OrchestratorConfig::default();
    config.failover.max_retries = 2;
    let orch = Orchestrator::new(config).unwrap();

    add(
        &orch,
        MockBackend::new("primary", Mode::Fail),
        BackendMetadata::default().with_priority(1),
    );
    add(
        &orch,
        MockBackend::new("secondary", Mode::Succeed),
        BackendMetadata::default().with_priority(2),
    );

    let response = orch
        .send(&ChatRequest::user("hi"), SelectionContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.backend, "secondary");
    assert_eq!(response.content, "answer from secondary");
    assert_eq!(
        orch.get_health_status("primary").unwrap().consecutive_failures,
        1
    );
    assert_eq!(orch.stats().failovers, 1);
}

/// When everything fails the error lists each attempted backend in order
#[tokio::test]
async fn test_exhaustion_lists_every_attempt() {
    let orch = orchestrator();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        add(
            &orch,
            MockBackend::new(name, Mode::Fail),
            BackendMetadata::default().with_priority(i as i32),
        );
    }

    let err = send(&orch, SelectionContext::new()).await.unwrap_err();
    let OrchestratorError::AllBackendsExhausted { attempts } = err else {
        panic!("expected exhaustion, got {err:?}");
    };
    let tried: Vec<_> = attempts.iter().map(|a| a.backend.as_str()).collect();
    assert_eq!(tried, vec!["a", "b", "c"]);
    assert!(attempts
        .iter()
        .all(|a| matches!(a.kind, AttemptErrorKind::Failed { .. })));
    assert_eq!(orch.stats().exhausted, 1);
}

/// A slow backend is abandoned at the attempt timeout
#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_fails_over() {
    let mut config = OrchestratorConfig::default();
    config.failover.attempt_timeout_ms = 100;
    let orch = Orchestrator::new(config).unwrap();

    add(
        &orch,
        MockBackend::new("slow", Mode::Succeed).with_delay(Duration::from_secs(5)),
        BackendMetadata::default().with_priority(1),
    );
    add(
        &orch,
        MockBackend::new("fast", Mode::Succeed),
        BackendMetadata::default().with_priority(2),
    );

    let response = orch
        .send(&ChatRequest::user("hi"), SelectionContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.backend, "fast");
    assert!(matches!(
        response.failed_attempts[0].kind,
        AttemptErrorKind::Timeout { .. }
    ));
}

// ============================================================================
// Budgets
// ============================================================================

/// An alert fires once per crossing per period
#[tokio::test]
async fn test_budget_alert_fires_once_per_period() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
    ));
    let orch = Orchestrator::with_clock(OrchestratorConfig::default(), clock.clone()).unwrap();
    add(
        &orch,
        MockBackend::new("paid", Mode::Succeed).with_usage(1_000, 0),
        BackendMetadata::default().with_pricing(30.0, 0.0),
    );

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    orch.on_budget_alert(Arc::new(move |alert: &BudgetAlert| {
        assert_eq!(alert.message, "80% of budget used");
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    orch.set_budget("paid", 100.0, BudgetPeriod::Monthly);
    orch.add_budget_alert("paid", 80.0, "80% of budget used")
        .unwrap();

    // $30, $60, $90 (crosses 80%), $120
    for _ in 0..4 {
        send(&orch, SelectionContext::new()).await.unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!((orch.get_total_cost(Some("paid")) - 120.0).abs() < 1e-9);

    clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 1).unwrap());
    for _ in 0..2 {
        send(&orch, SelectionContext::new()).await.unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    send(&orch, SelectionContext::new()).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    let status = orch.budget_status("paid").unwrap();
    assert!((status.spent - 90.0).abs() < 1e-9);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancelling mid-attempt returns Cancelled and blames nobody
#[tokio::test(start_paused = true)]
async fn test_cancellation_leaves_health_untouched() {
    let orch = orchestrator();
    let stuck = add(
        &orch,
        MockBackend::new("stuck", Mode::Hang),
        BackendMetadata::default().with_priority(1),
    );
    let backup = add(
        &orch,
        MockBackend::new("backup", Mode::Succeed),
        BackendMetadata::default().with_priority(2),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = orch
        .send(&ChatRequest::user("hi"), SelectionContext::new(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(stuck.calls(), 1);
    assert_eq!(backup.calls(), 0);
    for status in orch.get_all_health_statuses() {
        assert_eq!(status.state, HealthState::Unknown, "{}", status.backend);
        assert_eq!(status.total_requests, 0, "{}", status.backend);
    }
    assert_eq!(orch.stats().cancelled, 1);
}

/// A token cancelled up front never reaches a backend
#[tokio::test]
async fn test_pre_cancelled_request_is_not_dispatched() {
    let orch = orchestrator();
    let backend = add(
        &orch,
        MockBackend::new("a", Mode::Succeed),
        BackendMetadata::default(),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orch
        .send(&ChatRequest::user("hi"), SelectionContext::new(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(backend.calls(), 0);
}

/// Dropping a request mid-trial hands the half-open slot back
#[tokio::test(start_paused = true)]
async fn test_dropped_request_does_not_wedge_breaker() {
    let orch = orchestrator();
    let x = add(&orch, MockBackend::new("x", Mode::Hang), BackendMetadata::default());
    orch.circuit_breaker().force_open("x");
    tokio::time::advance(Duration::from_secs(31)).await;

    for expected_calls in 1..=2 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            orch.send(&ChatRequest::user("hi"), SelectionContext::new(), &CancellationToken::new()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(x.calls(), expected_calls);
        assert_eq!(orch.circuit_status("x").unwrap().state, CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(3_600)).await;
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// A call that finishes after its backend was unregistered leaves no trace
/// on a backend later registered under the same name
#[tokio::test(start_paused = true)]
async fn test_late_outcome_does_not_leak_into_reregistered_backend() {
    let orch = orchestrator();
    add(
        &orch,
        MockBackend::new("x", Mode::Fail).with_delay(Duration::from_millis(100)),
        BackendMetadata::default(),
    );

    let unregister = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.unregister_backend("x").unwrap();
    };
    let (result, ()) = tokio::join!(send(&orch, SelectionContext::new()), unregister);
    assert!(matches!(result, Err(OrchestratorError::AllBackendsExhausted { .. })));

    add(&orch, MockBackend::new("x", Mode::Succeed), BackendMetadata::default());
    let status = orch.get_health_status("x").unwrap();
    assert_eq!(status.total_requests, 0);
    assert_eq!(status.last_error, None);
    assert_eq!(orch.circuit_status("x").unwrap().consecutive_failures, 0);
}
