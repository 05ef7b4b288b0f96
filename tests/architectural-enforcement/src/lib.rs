//! Architectural Enforcement
//!
//! Source scanners shared by the tests in `tests/`. Each rule walks the
//! production sources of a workspace crate and reports offending lines:
//! - no sleeping outside retry backoff
//! - no `unwrap()`/`expect()` in library code
//! - no blocking I/O in the streaming path
//!
//! Everything from the first `#[cfg(test)]` of a file onwards is treated as
//! test code and skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["streamline/core/src", "streamline/cli/src"];

/// A rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File path relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root (two levels above this package)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// All `.rs` files under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root.join(dir))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|entry| entry.path().strip_prefix(&root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

/// Production lines of a file: `(line_number, code)` with comments removed
///
/// Stops at the first `#[cfg(test)]`.
#[must_use]
pub fn production_lines(relative: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(workspace_root().join(relative)) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter_map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (!code.trim().is_empty()).then(|| (idx + 1, code.to_string()))
        })
        .collect()
}

/// Scan production sources for lines matching `is_violation`
///
/// `allowed` is consulted per file (relative path) and skips it entirely.
pub fn scan(
    dirs: &[&str],
    allowed: impl Fn(&Path) -> bool,
    is_violation: impl Fn(&str) -> bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for dir in dirs {
        for path in rust_files(dir) {
            if allowed(&path) {
                continue;
            }
            for (line, code) in production_lines(&path) {
                if is_violation(&code) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        text: code.trim().to_string(),
                    });
                }
            }
        }
    }
    violations
}

/// Panic with a readable report if `violations` is not empty
///
/// # Panics
///
/// Panics when at least one violation is present.
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!("{rule}: {} violation(s)", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(
                !rust_files(dir).is_empty(),
                "no sources found under {dir}"
            );
        }
    }

    #[test]
    fn test_production_lines_skip_tests_and_comments() {
        let lines = production_lines(Path::new("tests/architectural-enforcement/src/lib.rs"));
        assert!(lines.iter().all(|(_, code)| !code.contains("test_production_dirs_exist")));
        assert!(lines.iter().all(|(_, code)| !code.contains("Source scanners shared")));
    }
}
