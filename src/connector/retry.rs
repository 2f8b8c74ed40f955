//! Same-child re-execution, with and without exponential delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::observe::hooks::{AttemptEvent, Hooks};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

/// Invokes its child up to `max_attempts` times in sequence with no delay
/// between attempts, returning the first success. Exhaustion returns the
/// last error; a canceled context aborts the attempt loop and reports the
/// cancellation instead of the underlying failure.
pub struct Retry<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    max_attempts: RwLock<u32>,
    on_attempt: Hooks<AttemptEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Retry<T> {
    /// A retry wrapper. `max_attempts` of zero is clamped to one.
    pub fn new(name: impl Into<String>, child: DynChainable<T>, max_attempts: u32) -> Self {
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            max_attempts: RwLock::new(max_attempts.max(1)),
            on_attempt: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The configured attempt budget.
    pub fn max_attempts(&self) -> u32 {
        *self.max_attempts.read()
    }

    /// Reconfigure the attempt budget; zero is clamped to one.
    pub fn set_max_attempts(&self, max_attempts: u32) {
        *self.max_attempts.write() = max_attempts.max(1);
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    /// Callbacks invoked after each failed attempt.
    pub fn on_attempt(&self) -> &Hooks<AttemptEvent> {
        &self.on_attempt
    }

    async fn run(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let child = self.child.read().clone();
        let max_attempts = *self.max_attempts.read();

        for attempt in 1..=max_attempts {
            if let Some(cause) = ctx.error() {
                return Err(PipelineError::from_context(
                    self.identity.name(),
                    cause,
                    Some(input),
                    Duration::ZERO,
                ));
            }

            match child.process(ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    metrics::record_retry_attempt(self.identity.name());
                    self.on_attempt.emit(&AttemptEvent {
                        connector: self.identity.name().to_string(),
                        attempt,
                        max_attempts,
                        error: err.to_string(),
                    });
                    if err.is_canceled() || attempt == max_attempts {
                        return Err(err.prepend(self.identity.name()));
                    }
                    debug!(
                        retry = self.identity.name(),
                        attempt, max_attempts, "attempt failed; retrying"
                    );
                }
            }
        }
        unreachable!("attempt loop always returns")
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Retry<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("retry", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::new(
            &self.identity,
            "retry",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata("max_attempts", (*self.max_attempts.read()).into())
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

/// Like [`Retry`], but waits before each re-attempt with exponential delay:
/// the first retry waits `base_delay`, the second `2 * base_delay`, and so
/// on. Waiting goes through the injected clock so fake clocks drive tests
/// deterministically, and returns promptly on context cancellation.
pub struct Backoff<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    max_attempts: RwLock<u32>,
    base_delay: RwLock<Duration>,
    jitter: RwLock<bool>,
    clock: Arc<dyn Clock>,
    on_attempt: Hooks<AttemptEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Backoff<T> {
    /// A backoff wrapper. `max_attempts` of zero is clamped to one.
    pub fn new(
        name: impl Into<String>,
        child: DynChainable<T>,
        max_attempts: u32,
        base_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            max_attempts: RwLock::new(max_attempts.max(1)),
            base_delay: RwLock::new(base_delay),
            jitter: RwLock::new(false),
            clock,
            on_attempt: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The configured attempt budget.
    pub fn max_attempts(&self) -> u32 {
        *self.max_attempts.read()
    }

    /// Reconfigure the attempt budget; zero is clamped to one.
    pub fn set_max_attempts(&self, max_attempts: u32) {
        *self.max_attempts.write() = max_attempts.max(1);
    }

    /// The delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        *self.base_delay.read()
    }

    /// Reconfigure the base delay.
    pub fn set_base_delay(&self, base_delay: Duration) {
        *self.base_delay.write() = base_delay;
    }

    /// Enable or disable jitter: up to ten percent of the delay added at
    /// random, to spread synchronized retry storms.
    pub fn set_jitter(&self, jitter: bool) {
        *self.jitter.write() = jitter;
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    /// Callbacks invoked after each failed attempt.
    pub fn on_attempt(&self) -> &Hooks<AttemptEvent> {
        &self.on_attempt
    }

    fn delay_for(&self, failed_attempt: u32, base: Duration, jitter: bool) -> Duration {
        let factor = 1u32 << (failed_attempt - 1).min(31);
        let delay = base.checked_mul(factor).unwrap_or(Duration::MAX);
        if jitter && delay > Duration::ZERO {
            let extra = delay.as_secs_f64() * rand::thread_rng().gen::<f64>() * 0.1;
            delay + Duration::from_secs_f64(extra)
        } else {
            delay
        }
    }

    async fn run(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let child = self.child.read().clone();
        let max_attempts = *self.max_attempts.read();
        let base = *self.base_delay.read();
        let jitter = *self.jitter.read();
        let started = self.clock.now();

        for attempt in 1..=max_attempts {
            if let Some(cause) = ctx.error() {
                return Err(PipelineError::from_context(
                    self.identity.name(),
                    cause,
                    Some(input),
                    self.clock.since(started),
                ));
            }

            match child.process(ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    metrics::record_retry_attempt(self.identity.name());
                    self.on_attempt.emit(&AttemptEvent {
                        connector: self.identity.name().to_string(),
                        attempt,
                        max_attempts,
                        error: err.to_string(),
                    });
                    if err.is_canceled() || attempt == max_attempts {
                        return Err(err.prepend(self.identity.name()));
                    }

                    let delay = self.delay_for(attempt, base, jitter);
                    warn!(
                        backoff = self.identity.name(),
                        attempt,
                        max_attempts,
                        ?delay,
                        "attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = self.clock.sleep(delay) => {}
                        _ = ctx.cancelled() => {
                            let cause = ctx.error().unwrap_or(crate::core::ContextError::Canceled);
                            return Err(PipelineError::from_context(
                                self.identity.name(),
                                cause,
                                Some(input),
                                self.clock.since(started),
                            ));
                        }
                    }
                }
            }
        }
        unreachable!("attempt loop always returns")
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Backoff<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("backoff", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::new(
            &self.identity,
            "backoff",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata("max_attempts", (*self.max_attempts.read()).into())
        .with_metadata(
            "base_delay_ms",
            (self.base_delay.read().as_millis() as u64).into(),
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
