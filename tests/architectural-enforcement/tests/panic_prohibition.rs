//! Panic Prohibition
//!
//! Library code propagates errors; `unwrap()` and `expect()` are reserved
//! for tests.

use std::path::Path;

use architectural_enforcement::{assert_clean, scan};

fn is_panicking_call(code: &str) -> bool {
    code.contains(".unwrap()") || code.contains(".expect(") || code.contains("panic!(")
}

#[test]
fn test_no_unwrap_in_core() {
    let violations = scan(&["streamline/core/src"], |_| false, is_panicking_call);
    assert_clean("unwrap/expect/panic in library code", &violations);
}

#[test]
fn test_no_unwrap_in_cli() {
    let violations = scan(&["streamline/cli/src"], |_| false, is_panicking_call);
    assert_clean("unwrap/expect/panic in the binary", &violations);
}

#[test]
fn test_detector_matches_expected_forms() {
    assert!(is_panicking_call("let x = y.unwrap();"));
    assert!(is_panicking_call("y.expect(\"msg\")"));
    assert!(!is_panicking_call("y.unwrap_or_default()"));
    assert!(!is_panicking_call("y.unwrap_or_else(|_| z)"));
    assert!(Path::new("streamline/core/src").is_relative());
}
