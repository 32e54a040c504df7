//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The orchestrator core runs on the tokio runtime and owns no
//! files or sockets. Blocking I/O would stall every request sharing the
//! worker thread, so none is allowed in production code.

use architectural_enforcement::scan;

const FORBIDDEN: &[&str] = &[
    "std::fs::",
    "std::net::",
    "std::process::Command",
    "std::io::stdin",
    "File::open(",
    "File::create(",
    "reqwest::blocking",
    "block_on(",
];

fn is_blocking_io(code: &str) -> bool {
    FORBIDDEN.iter().any(|pattern| code.contains(pattern))
}

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = scan(is_blocking_io);

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nForbidden: {}", FORBIDDEN.join(", "));
        eprintln!("Configuration is passed in as text; backends own their transports.");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_blocking_io_detection() {
    assert!(is_blocking_io("let text = std::fs::read_to_string(path)?;"));
    assert!(is_blocking_io("futures::executor::block_on(fut)"));
    assert!(!is_blocking_io("let config = toml::from_str(content)?;"));
}
