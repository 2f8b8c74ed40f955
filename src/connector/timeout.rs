//! Deadline enforcement with a background completion race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::clock::Clock;
use crate::core::{
    recover, Chainable, Context, ContextError, DynChainable, Identity, Payload, PipelineError,
};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

/// Runs its child on a background task and races completion against a
/// deadline. When the deadline wins, the original input is returned inside
/// a structured error with the timeout flag set; the background task is not
/// killed, it is expected to observe its canceled context and wind down.
///
/// Nested timeouts compose through the context chain: the child context
/// derives from the caller's, so an outer deadline still cuts an inner
/// child short.
pub struct Timeout<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    duration: RwLock<Duration>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl<T: Payload> Timeout<T> {
    /// A timeout wrapper enforcing `duration`.
    pub fn new(
        name: impl Into<String>,
        child: DynChainable<T>,
        duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            duration: RwLock::new(duration),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// The enforced deadline.
    pub fn duration(&self) -> Duration {
        *self.duration.read()
    }

    /// Reconfigure the deadline.
    pub fn set_duration(&self, duration: Duration) {
        *self.duration.write() = duration;
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    async fn run(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        if let Some(cause) = ctx.error() {
            return Err(PipelineError::from_context(
                self.identity.name(),
                cause,
                Some(input),
                Duration::ZERO,
            ));
        }

        let child = self.child.read().clone();
        let duration = *self.duration.read();
        let started = self.clock.now();

        let child_ctx = ctx.child();
        let task_ctx = child_ctx.clone();
        let task_input = input.clone();
        let mut handle =
            tokio::spawn(async move { child.process(&task_ctx, task_input).await });

        tokio::select! {
            joined = &mut handle => {
                child_ctx.cancel();
                match joined {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(err.prepend(self.identity.name())),
                    // The child guards its own panics; a join error here means
                    // the task was torn down underneath us.
                    Err(join_err) => Err(PipelineError::panic(
                        self.identity.name(),
                        recover::sanitize_panic_message(&join_err.to_string()),
                        self.clock.since(started),
                    )),
                }
            }
            _ = self.clock.sleep(duration) => {
                child_ctx.cancel_with(ContextError::DeadlineExceeded);
                metrics::record_timeout(self.identity.name());
                warn!(timeout = self.identity.name(), ?duration, "deadline exceeded");
                Err(PipelineError::from_context(
                    self.identity.name(),
                    ContextError::DeadlineExceeded,
                    Some(input),
                    self.clock.since(started),
                ))
            }
            _ = ctx.cancelled() => {
                child_ctx.cancel();
                let cause = ctx.error().unwrap_or(ContextError::Canceled);
                Err(PipelineError::from_context(
                    self.identity.name(),
                    cause,
                    Some(input),
                    self.clock.since(started),
                ))
            }
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Timeout<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("timeout", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::new(
            &self.identity,
            "timeout",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata(
            "duration_ms",
            (self.duration.read().as_millis() as u64).into(),
        )
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let child = self.child.read().clone();
        child
            .close()
            .await
            .map_err(|err| err.prepend(self.identity.name()))
    }
}
