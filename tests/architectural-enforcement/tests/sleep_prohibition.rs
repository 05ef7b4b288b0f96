//! Sleep Prohibition
//!
//! Production code waits on I/O, cancellation or timers it owns. The only
//! accepted sleep is the retry backoff in the controller, which always races
//! against cancellation.

use std::path::Path;

use architectural_enforcement::{assert_clean, scan, PRODUCTION_DIRS};

const BACKOFF_FILE: &str = "streamline/core/src/controller/mod.rs";

fn is_sleep(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(")
}

#[test]
fn test_no_sleep_outside_backoff() {
    let violations = scan(
        PRODUCTION_DIRS,
        |path| path == Path::new(BACKOFF_FILE),
        is_sleep,
    );
    assert_clean("sleep in production code", &violations);
}

#[test]
fn test_backoff_sleep_is_cancellable() {
    let source = std::fs::read_to_string(
        architectural_enforcement::workspace_root().join(BACKOFF_FILE),
    )
    .unwrap();
    let lines: Vec<&str> = source.lines().collect();

    let sleeps: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_sleep(line))
        .map(|(idx, _)| idx)
        .collect();
    assert!(!sleeps.is_empty(), "backoff sleep not found");

    for idx in sleeps {
        let window = &lines[idx.saturating_sub(4)..idx];
        assert!(
            window.iter().any(|line| line.contains("cancelled()")),
            "sleep at {BACKOFF_FILE}:{} does not race cancellation",
            idx + 1
        );
    }
}

#[test]
fn test_no_thread_sleep_anywhere() {
    let violations = scan(PRODUCTION_DIRS, |_| false, |code| {
        code.contains("thread::sleep")
    });
    assert_clean("blocking thread sleep", &violations);
}
