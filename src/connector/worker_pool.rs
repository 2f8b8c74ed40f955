//! Bounded-concurrency dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::{
    recover, Chainable, Context, ContextError, DynChainable, Identity, Payload, PipelineError,
};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

const FULL_MESSAGE: &str = "worker pool at capacity";

/// What to do when no permit is immediately available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Block until a permit frees up or the context is canceled.
    Wait,
    /// Fail immediately without invoking the child.
    FailFast,
}

/// Caps how many calls run the inner chainable simultaneously.
///
/// A semaphore of `capacity` permits guards dispatch; the permit is held
/// for the duration of the child call and released on every exit path,
/// recovered panics included.
pub struct WorkerPool<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    mode: RwLock<PoolMode>,
    closed: AtomicBool,
}

impl<T: Payload> WorkerPool<T> {
    /// A pool of `capacity` permits around `child`, in [`PoolMode::Wait`].
    /// Zero capacity is clamped to one.
    pub fn new(name: impl Into<String>, child: DynChainable<T>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            mode: RwLock::new(PoolMode::Wait),
            closed: AtomicBool::new(false),
        }
    }

    /// The permit count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The admission mode.
    pub fn mode(&self) -> PoolMode {
        *self.mode.read()
    }

    /// Reconfigure the admission mode.
    pub fn set_mode(&self, mode: PoolMode) {
        *self.mode.write() = mode;
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

        let mode = *self.mode.read();
        let _permit = match mode {
            PoolMode::FailFast => match self.semaphore.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    metrics::record_rejection(self.identity.name(), "pool_full");
                    debug!(pool = self.identity.name(), "rejecting call at capacity");
                    return Err(PipelineError::rejected(self.identity.name(), FULL_MESSAGE));
                }
            },
            PoolMode::Wait => {
                tokio::select! {
                    acquired = self.semaphore.acquire() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => {
                            // The semaphore only closes when the pool does.
                            return Err(PipelineError::rejected(self.identity.name(), FULL_MESSAGE));
                        }
                    },
                    _ = ctx.cancelled() => {
                        let cause = ctx.error().unwrap_or(ContextError::Canceled);
                        return Err(PipelineError::from_context(
                            self.identity.name(),
                            cause,
                            Some(input),
                            Duration::ZERO,
                        ));
                    }
                }
            }
        };

        let child = self.child.read().clone();
        child
            .process(ctx, input)
            .await
            .map_err(|err| err.prepend(self.identity.name()))
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for WorkerPool<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("worker_pool", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::new(
            &self.identity,
            "worker_pool",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata("capacity", (self.capacity as u64).into())
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.semaphore.close();
        let child = self.child.read().clone();
        child
            .close()
            .await
            .map_err(|err| err.prepend(self.identity.name()))
    }
}
