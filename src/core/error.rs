//! Structured pipeline errors.
//!
//! Every failure that crosses a chainable boundary is a [`PipelineError`]:
//! it records the path of connector names from the outermost connector down
//! to the failing leaf, the input that entered the failing node, the
//! underlying cause, and timing. Connectors prepend their own name as the
//! error unwinds, so callers see a full dotted trail.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::context::ContextError;

/// Boxed error type accepted from user processors.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by connector configuration setters.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An index-based child operation landed outside the child list.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// The current child count.
        len: usize,
    },

    /// A refill rate must be strictly positive.
    #[error("rate must be positive, got {0}")]
    NonPositiveRate(f64),

    /// A bucket capacity must admit at least one call.
    #[error("burst must be at least 1")]
    ZeroBurst,
}

/// The underlying cause of a [`PipelineError`].
#[derive(Clone)]
pub enum ErrorCause<T> {
    /// A user-supplied function returned an error.
    User(Arc<dyn std::error::Error + Send + Sync>),

    /// A structured child error kept whole rather than path-merged.
    Nested(Box<PipelineError<T>>),

    /// The context was canceled or its deadline expired.
    Context(ContextError),

    /// Admission control refused the call before any child ran.
    Rejected(String),

    /// A racing group finished without producing a winner.
    NoWinner {
        /// Why no winner emerged.
        reason: String,
        /// The last child error observed, when any child errored.
        last: Option<Box<PipelineError<T>>>,
    },

    /// A programming error in how the connector was assembled.
    Usage(String),

    /// A recovered panic, message sanitized.
    Panic(String),
}

impl<T> fmt::Display for ErrorCause<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::User(err) => write!(f, "{err}"),
            ErrorCause::Nested(err) => write!(f, "{err}"),
            ErrorCause::Context(err) => write!(f, "{err}"),
            ErrorCause::Rejected(msg) | ErrorCause::Usage(msg) => f.write_str(msg),
            ErrorCause::NoWinner { reason, last } => match last {
                Some(err) => write!(f, "{reason}: {err}"),
                None => f.write_str(reason),
            },
            ErrorCause::Panic(msg) => write!(f, "panic: {msg}"),
        }
    }
}

impl<T> fmt::Debug for ErrorCause<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::User(err) => f.debug_tuple("User").field(err).finish(),
            ErrorCause::Nested(err) => f.debug_tuple("Nested").field(err).finish(),
            ErrorCause::Context(err) => f.debug_tuple("Context").field(err).finish(),
            ErrorCause::Rejected(msg) => f.debug_tuple("Rejected").field(msg).finish(),
            ErrorCause::NoWinner { reason, last } => f
                .debug_struct("NoWinner")
                .field("reason", reason)
                .field("last", last)
                .finish(),
            ErrorCause::Usage(msg) => f.debug_tuple("Usage").field(msg).finish(),
            ErrorCause::Panic(msg) => f.debug_tuple("Panic").field(msg).finish(),
        }
    }
}

/// A structured failure value carrying the path through the connector tree,
/// the failing input, timing, and cause classification.
#[derive(Clone)]
pub struct PipelineError<T> {
    /// Identity names from the outermost connector down to the failing leaf.
    /// Never empty.
    pub path: Vec<String>,

    /// The input that entered the failing node. Absent for rejections,
    /// which never touched a child, and for recovered panics.
    pub input_data: Option<T>,

    /// The underlying cause.
    pub cause: ErrorCause<T>,

    /// Wall time at failure.
    pub timestamp: DateTime<Utc>,

    /// Elapsed time from the node's entry to its failure.
    pub duration: Duration,

    /// Set when the failure was a deadline expiry.
    pub timeout: bool,

    /// Set when the failure was an explicit cancellation.
    pub canceled: bool,
}

impl<T> PipelineError<T> {
    /// Build an error rooted at `name`.
    pub fn new(
        name: impl Into<String>,
        cause: ErrorCause<T>,
        input: Option<T>,
        duration: Duration,
    ) -> Self {
        Self {
            path: vec![name.into()],
            input_data: input,
            cause,
            timestamp: Utc::now(),
            duration,
            timeout: false,
            canceled: false,
        }
    }

    /// Wrap an arbitrary user error at the leaf that produced it.
    pub fn from_user(
        name: impl Into<String>,
        err: impl Into<DynError>,
        input: Option<T>,
        duration: Duration,
    ) -> Self {
        Self::new(
            name,
            ErrorCause::User(Arc::from(err.into())),
            input,
            duration,
        )
    }

    /// Classify a cancellation or deadline expiry observed from the context.
    pub fn from_context(
        name: impl Into<String>,
        cause: ContextError,
        input: Option<T>,
        duration: Duration,
    ) -> Self {
        let mut err = Self::new(name, ErrorCause::Context(cause), input, duration);
        match cause {
            ContextError::Canceled => err.canceled = true,
            ContextError::DeadlineExceeded => err.timeout = true,
        }
        err
    }

    /// An admission-control rejection. Carries the connector's name only.
    pub fn rejected(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            name,
            ErrorCause::Rejected(reason.into()),
            None,
            Duration::ZERO,
        )
    }

    /// A programming error surfaced at process time.
    pub fn usage(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, ErrorCause::Usage(message.into()), None, Duration::ZERO)
    }

    /// A recovered panic with an already-sanitized message.
    pub fn panic(name: impl Into<String>, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, ErrorCause::Panic(message.into()), None, duration)
    }

    /// Prepend a connector's name as the error unwinds through it.
    pub fn prepend(mut self, name: &str) -> Self {
        self.path.insert(0, name.to_string());
        self
    }

    /// Mark the error as a deadline expiry.
    pub fn timed_out(mut self) -> Self {
        self.timeout = true;
        self
    }

    /// True when the flag is set or the cause chain reaches a
    /// deadline-exceeded cause.
    pub fn is_timeout(&self) -> bool {
        if self.timeout {
            return true;
        }
        match &self.cause {
            ErrorCause::Context(ContextError::DeadlineExceeded) => true,
            ErrorCause::Nested(inner) => inner.is_timeout(),
            _ => false,
        }
    }

    /// True when the flag is set or the cause chain reaches a canceled
    /// cause.
    pub fn is_canceled(&self) -> bool {
        if self.canceled {
            return true;
        }
        match &self.cause {
            ErrorCause::Context(ContextError::Canceled) => true,
            ErrorCause::Nested(inner) => inner.is_canceled(),
            _ => false,
        }
    }

    /// The path rendered as a dotted trail.
    pub fn path_string(&self) -> String {
        self.path.join(" -> ")
    }
}

impl<T> fmt::Display for PipelineError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.is_timeout() {
            "timed out"
        } else if self.is_canceled() {
            "canceled"
        } else {
            "failed"
        };
        write!(
            f,
            "{} {} after {:?}: {}",
            self.path_string(),
            verb,
            self.duration,
            self.cause
        )
    }
}

impl<T> fmt::Debug for PipelineError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineError")
            .field("path", &self.path)
            .field("cause", &self.cause)
            .field("input_data", &self.input_data.is_some())
            .field("duration", &self.duration)
            .field("timeout", &self.timeout)
            .field("canceled", &self.canceled)
            .finish()
    }
}

impl<T: 'static> std::error::Error for PipelineError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            ErrorCause::User(err) => Some(err.as_ref()),
            ErrorCause::Nested(err) => Some(err.as_ref()),
            ErrorCause::Context(err) => Some(err),
            ErrorCause::NoWinner {
                last: Some(err), ..
            } => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_path_and_verb() {
        let err: PipelineError<String> = PipelineError::from_user(
            "parse",
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad record"),
            Some("raw".to_string()),
            Duration::from_millis(12),
        )
        .prepend("pipeline");

        let rendered = err.to_string();
        assert!(rendered.starts_with("pipeline -> parse failed after"));
        assert!(rendered.ends_with("bad record"));
    }

    #[test]
    fn test_timeout_classification_via_cause() {
        let err: PipelineError<i32> = PipelineError::from_context(
            "slow",
            ContextError::DeadlineExceeded,
            None,
            Duration::from_millis(200),
        );

        assert!(err.is_timeout());
        assert!(!err.is_canceled());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_cancel_classification_survives_nesting() {
        let inner: PipelineError<i32> =
            PipelineError::from_context("leaf", ContextError::Canceled, None, Duration::ZERO);
        let outer = PipelineError::new(
            "outer",
            ErrorCause::Nested(Box::new(inner)),
            None,
            Duration::ZERO,
        );

        assert!(outer.is_canceled());
        assert!(!outer.is_timeout());
    }

    #[test]
    fn test_prepend_builds_dotted_trail() {
        let err: PipelineError<i32> =
            PipelineError::usage("contest", "no winning condition set")
                .prepend("stage")
                .prepend("root");

        assert_eq!(err.path, vec!["root", "stage", "contest"]);
        assert_eq!(err.path_string(), "root -> stage -> contest");
    }

    #[test]
    fn test_rejection_carries_no_input() {
        let err: PipelineError<i32> = PipelineError::rejected("breaker", "circuit breaker is open");
        assert!(err.input_data.is_none());
        assert!(matches!(err.cause, ErrorCause::Rejected(_)));
    }
}
