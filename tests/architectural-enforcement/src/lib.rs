//! Architectural Enforcement
//!
//! Source scanners used by the integration tests in `tests/`. They enforce
//! rules on the orchestrator's production code:
//! - No sleeping: waits are driven by timers, intervals or cancellation
//! - No blocking I/O inside the async core
//!
//! Test code is exempt. A file's production region ends at its first
//! `#[cfg(test)]`, and `test_utils.rs` files are skipped entirely.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_ROOTS: &[&str] = &["orchestrator/core/src"];

/// A rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending source line, trimmed
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.source)
    }
}

/// Workspace root, resolved from this crate's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// Every production `.rs` file under the production roots
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_ROOTS {
        let path = root.join(dir);
        assert!(path.exists(), "production root missing: {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            let is_rust = path.extension().and_then(|s| s.to_str()) == Some("rs");
            let is_test_support = path.file_name().and_then(|s| s.to_str()) == Some("test_utils.rs");
            if is_rust && !is_test_support {
                files.push(path.to_path_buf());
            }
        }
    }
    files.sort();
    files
}

/// Lines before the first `#[cfg(test)]`, paired with 1-based line numbers
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

/// Code portion of a line, without a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    line.split("//").next().unwrap_or(line)
}

/// Scan production code and report lines matched by `is_violation`
pub fn scan(is_violation: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_files() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, text) in production_lines(&content) {
            if is_violation(code_part(text)) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    source: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_region_stops_at_cfg_test() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() {} }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_comments_are_ignored() {
        assert_eq!(code_part("    // tokio::time::sleep(d)"), "");
        assert_eq!(code_part("//! std::fs::read"), "");
        assert_eq!(code_part("let x = 1; // sleep("), "let x = 1; ");
    }

    #[test]
    fn test_production_files_found() {
        let files = production_files();
        assert!(files.iter().any(|p| p.ends_with("lib.rs")));
        assert!(!files.iter().any(|p| p.ends_with("test_utils.rs")));
    }
}
