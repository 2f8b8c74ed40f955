//! Observability side-channels: hooks, metrics, and the tracing spans the
//! connectors emit.
//!
//! All of these are zero-cost when unused: hook emission short-circuits on
//! an empty subscriber list, metric recording is a counter bump, and spans
//! are no-ops without a subscriber installed. None of them alter process
//! semantics.

pub mod hooks;
pub mod metrics;

pub use hooks::{
    AttemptEvent, BreakerEvent, ChildErrorEvent, Hooks, LimiterEvent, WinnerEvent,
};
