//! Blocking I/O Prohibition
//!
//! The streaming path (transport, framing, sessions, controller, tokens)
//! runs on the async runtime and must not touch `std::fs`, `std::net` or
//! blocking stdin. Loading the config file at startup is the exception.

use std::path::Path;

use architectural_enforcement::{assert_clean, scan};

const ALLOWED: &[&str] = &["streamline/core/src/config.rs"];

fn is_blocking_io(code: &str) -> bool {
    ["std::fs", "std::net", "std::io::stdin", "File::open", "read_to_string("]
        .iter()
        .any(|pattern| code.contains(pattern))
}

#[test]
fn test_no_blocking_io_in_streaming_path() {
    let violations = scan(
        &["streamline/core/src"],
        |path| ALLOWED.iter().any(|allowed| path == Path::new(allowed)),
        is_blocking_io,
    );
    assert_clean("blocking I/O in the streaming path", &violations);
}
