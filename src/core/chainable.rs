//! The uniform contract every processor and connector implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::context::Context;
use crate::core::error::PipelineError;
use crate::core::identity::Identity;
use crate::schema::Node;

/// Payload constraint for the whole library.
///
/// `Clone` must produce a value isolated from the original: fan-out
/// connectors hand each child its own copy and mutations on one copy must
/// never be observable on another. Payloads holding shared interior
/// mutability (`Arc<Mutex<..>>` and friends) break that contract.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// A shared, type-erased chainable.
pub type DynChainable<T> = Arc<dyn Chainable<T>>;

/// Anything that can process a value of type `T`.
///
/// Implementers must not retain the input beyond the call, must honor
/// context cancellation promptly at every suspension point, and must never
/// let a panic escape the process boundary.
#[async_trait]
pub trait Chainable<T: Payload>: Send + Sync {
    /// Transform `input`, or explain why that was impossible.
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>>;

    /// The stable identity of this node.
    fn identity(&self) -> &Identity;

    /// The identity's short name.
    fn name(&self) -> &str {
        self.identity().name()
    }

    /// A descriptive view of this node and its children.
    fn schema(&self) -> Node;

    /// Release owned resources, children first. Idempotent.
    async fn close(&self) -> Result<(), PipelineError<T>> {
        Ok(())
    }

    /// Erase the concrete type for storage inside a connector.
    fn into_dyn(self) -> DynChainable<T>
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }
}
