//! Error observation side-channel.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::schema::{Flow, Node};

/// Invokes its primary; on success the result passes straight through. On
/// error the handler pipeline receives the fully-populated error value, its
/// own outcome is ignored, and the *original* error propagates upward.
///
/// Handle never hides a failure, it only lets observers react: logging,
/// compensating actions, releasing reservations.
pub struct Handle<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    error_handler: RwLock<DynChainable<PipelineError<T>>>,
    closed: AtomicBool,
}

impl<T: Payload> Handle<T> {
    /// A handle over `child`, observing errors with `error_handler`.
    pub fn new(
        name: impl Into<String>,
        child: DynChainable<T>,
        error_handler: DynChainable<PipelineError<T>>,
    ) -> Self {
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            error_handler: RwLock::new(error_handler),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    /// Replace the error handler.
    pub fn set_error_handler(&self, error_handler: DynChainable<PipelineError<T>>) {
        *self.error_handler.write() = error_handler;
    }

    async fn run(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        if let Some(cause) = ctx.error() {
            return Err(PipelineError::from_context(
                self.identity.name(),
                cause,
                Some(input),
                std::time::Duration::ZERO,
            ));
        }

        let child = self.child.read().clone();
        match child.process(ctx, input).await {
            Ok(output) => Ok(output),
            Err(err) => {
                let err = err.prepend(self.identity.name());
                let handler = self.error_handler.read().clone();
                if let Err(handler_err) = handler.process(ctx, err.clone()).await {
                    // The handler's own failure is observed and dropped;
                    // the original error is what callers see.
                    debug!(
                        handle = self.identity.name(),
                        error = %handler_err,
                        "error handler failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Handle<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("handle", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::new(
            &self.identity,
            "handle",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: Some(Box::new(self.error_handler.read().schema())),
            }),
        )
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let child = self.child.read().clone();
        let handler = self.error_handler.read().clone();

        let child_result = child.close().await;
        // The handler pipeline closes too, but its payload type differs;
        // its failure cannot be merged into ours and is logged instead.
        if let Err(handler_err) = handler.close().await {
            debug!(
                handle = self.identity.name(),
                error = %handler_err,
                "error handler close failed"
            );
        }
        child_result.map_err(|err| err.prepend(self.identity.name()))
    }
}
