//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Orchestrator production code never sleeps. Periodic work uses
//! `tokio::time::interval`, deadlines use `tokio::time::timeout`, and waits
//! on other tasks use cancellation tokens or channels.

use architectural_enforcement::scan;

fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")
}

/// Test that production code does not contain sleep calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(is_sleep_call);

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse instead:");
        eprintln!("  - tokio::time::interval() for periodic tasks");
        eprintln!("  - tokio::time::timeout() for deadlines");
        eprintln!("  - CancellationToken::cancelled() to wait for shutdown");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_sleep_detection() {
    assert!(is_sleep_call("    tokio::time::sleep(Duration::from_millis(10)).await;"));
    assert!(is_sleep_call("std::thread::sleep(d);"));
    assert!(is_sleep_call("tokio::time::sleep_until(deadline).await;"));
    assert!(!is_sleep_call("let mut ticker = tokio::time::interval(period);"));
}
