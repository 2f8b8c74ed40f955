//! Core types: the chainable contract, identity, context, structured
//! errors, and panic recovery.

mod chainable;
mod context;
mod error;
mod identity;
pub(crate) mod recover;

pub use chainable::{Chainable, DynChainable, Payload};
pub use context::{Context, ContextError};
pub use error::{ConfigError, DynError, ErrorCause, PipelineError};
pub use identity::Identity;
