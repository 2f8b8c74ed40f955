//! Panic recovery at every chainable boundary.
//!
//! User functions are untrusted; a panic inside one must surface as a
//! structured error rather than tear down the caller's task. The recovered
//! message is sanitized before it can reach remote observers: memory
//! addresses, file paths, and backtrace fragments are stripped and the text
//! is truncated.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{warn, Instrument};

use crate::core::error::PipelineError;
use crate::observe::metrics;

const MAX_PANIC_MESSAGE_LEN: usize = 256;
const OPAQUE_PANIC_MESSAGE: &str = "panic with non-string payload";

lazy_static! {
    static ref HEX_ADDRESS: Regex = Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    static ref SOURCE_PATH: Regex = Regex::new(r"[A-Za-z]?:?[\\/][\w.\-\\/]+\.rs(:\d+(:\d+)?)?").unwrap();
}

/// Run a process body, converting any panic into a structured error rooted
/// at `name`. Also records the per-process metrics and tracing span shared
/// by every connector.
pub(crate) async fn guard<T, F>(
    kind: &'static str,
    name: &str,
    body: F,
) -> Result<T, PipelineError<T>>
where
    F: Future<Output = Result<T, PipelineError<T>>>,
{
    let started = Instant::now();
    let span = tracing::debug_span!("process", connector = kind, name = %name);
    let outcome = AssertUnwindSafe(body).catch_unwind().instrument(span).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(value)) => {
            metrics::record_process(kind, "success", elapsed);
            Ok(value)
        }
        Ok(Err(err)) => {
            metrics::record_process(kind, "error", elapsed);
            Err(err)
        }
        Err(payload) => {
            metrics::record_process(kind, "panic", elapsed);
            metrics::record_panic(name);
            let message = sanitize_panic_message(&panic_message(payload.as_ref()));
            warn!(connector = kind, name, %message, "recovered panic at chainable boundary");
            Err(PipelineError::panic(name, message, elapsed))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        OPAQUE_PANIC_MESSAGE.to_string()
    }
}

/// Strip addresses, source paths, and backtrace fragments; keep only the
/// first line and cap the length.
pub(crate) fn sanitize_panic_message(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("");
    let no_addresses = HEX_ADDRESS.replace_all(first_line, "0x?");
    let no_paths = SOURCE_PATH.replace_all(&no_addresses, "<path>");
    let mut message = no_paths.trim().to_string();
    if message.is_empty() {
        message = OPAQUE_PANIC_MESSAGE.to_string();
    }
    if message.len() > MAX_PANIC_MESSAGE_LEN {
        let mut cut = MAX_PANIC_MESSAGE_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCause;

    #[test]
    fn test_sanitize_strips_addresses_and_paths() {
        let raw = "index out of bounds at 0xdeadbeef in /home/user/app/src/worker.rs:42:7";
        let clean = sanitize_panic_message(raw);

        assert!(!clean.contains("0xdeadbeef"));
        assert!(!clean.contains("worker.rs"));
        assert!(clean.contains("index out of bounds"));
    }

    #[test]
    fn test_sanitize_keeps_first_line_only() {
        let raw = "boom\nstack backtrace:\n  0: std::panicking::begin_panic";
        assert_eq!(sanitize_panic_message(raw), "boom");
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let raw = "x".repeat(1000);
        let clean = sanitize_panic_message(&raw);
        assert!(clean.len() <= MAX_PANIC_MESSAGE_LEN + 3);
        assert!(clean.ends_with("..."));
    }

    #[test]
    fn test_sanitize_replaces_empty_payloads() {
        assert_eq!(sanitize_panic_message(""), OPAQUE_PANIC_MESSAGE);
        assert_eq!(sanitize_panic_message("\n\n"), OPAQUE_PANIC_MESSAGE);
    }

    #[tokio::test]
    async fn test_guard_converts_panic_to_error() {
        let result: Result<i32, PipelineError<i32>> = guard("test", "exploder", async {
            panic!("blew up at 0xabc123");
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.path, vec!["exploder"]);
        match &err.cause {
            ErrorCause::Panic(msg) => {
                assert!(msg.contains("blew up"));
                assert!(!msg.contains("0xabc123"));
            }
            other => panic!("expected panic cause, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guard_passes_through_success_and_errors() {
        let ok: Result<i32, PipelineError<i32>> = guard("test", "fine", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<i32, PipelineError<i32>> = guard("test", "sad", async {
            Err(PipelineError::usage("sad", "bad wiring"))
        })
        .await;
        assert_eq!(err.unwrap_err().path, vec!["sad"]);
    }
}
