//! # pipeflow
//!
//! Composable, failure-protected data-processing pipelines over a single
//! statically-typed value.
//!
//! Small named steps ([`processor`]s) compose into trees of [`connector`]s
//! that all share one uniform operation: given a [`Context`] and an input
//! of type `T`, return a transformed `T` or a structured [`PipelineError`]
//! carrying the path through the tree, timing, and cause classification.
//!
//! ## Key pieces
//!
//! - **Sequencing**: [`connector::Sequence`] for fail-fast left-to-right
//!   composition, [`connector::Switch`] and [`connector::Filter`] for
//!   data-driven routing, [`connector::Fallback`] for ordered backups.
//! - **Resilience**: [`connector::Retry`] and [`connector::Backoff`] for
//!   re-execution, [`connector::Timeout`] for deadlines,
//!   [`connector::CircuitBreaker`] for failure shedding,
//!   [`connector::RateLimiter`] for token-bucket admission.
//! - **Parallelism**: [`connector::Concurrent`] and
//!   [`connector::Scaffold`] for clone fan-out, [`connector::Race`] and
//!   [`connector::Contest`] for first-winner racing,
//!   [`connector::WorkerPool`] for bounded dispatch,
//!   [`connector::Handle`] for error observation.
//! - **Determinism**: every time-dependent connector takes an injected
//!   [`Clock`]; tests drive a fake clock from [`testing`].
//!
//! ## Example
//!
//! ```
//! use pipeflow::{Chainable, Context};
//! use pipeflow::connector::Sequence;
//! use pipeflow::processor::Transform;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pipeline = Sequence::with_steps(
//!     "normalize",
//!     vec![
//!         Transform::new("trim", |_ctx, s: String| async move {
//!             s.trim().to_string()
//!         })
//!         .into_dyn(),
//!         Transform::new("upper", |_ctx, s: String| async move {
//!             s.to_uppercase()
//!         })
//!         .into_dyn(),
//!     ],
//! );
//!
//! let out = pipeline
//!     .process(&Context::background(), "  hello world  ".into())
//!     .await
//!     .unwrap();
//! assert_eq!(out, "HELLO WORLD");
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Core types: the chainable contract, identity, context, errors.
pub mod core;

/// Injectable time source.
pub mod clock;

/// Leaf processors wrapping user functions.
pub mod processor;

/// Interior connectors composing child chainables.
pub mod connector;

/// Descriptive schema tree with JSON marshaling.
pub mod schema;

/// Hooks, metrics, and tracing side-channels.
pub mod observe;

/// Deterministic test support.
pub mod testing;

pub use crate::clock::{Clock, SystemClock};
pub use crate::core::{
    Chainable, ConfigError, Context, ContextError, DynChainable, DynError, ErrorCause, Identity,
    Payload, PipelineError,
};
pub use crate::schema::{Flow, Node};
