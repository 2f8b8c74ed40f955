//! Token-bucket admission control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::clock::Clock;
use crate::core::{
    recover, Chainable, ConfigError, Context, DynChainable, Identity, Payload, PipelineError,
};
use crate::observe::hooks::{Hooks, LimiterEvent};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

const EXCEEDED_MESSAGE: &str = "rate limit exceeded";

/// What to do when no token is immediately available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterMode {
    /// Block until a token is available or the context is canceled.
    Wait,
    /// Fail immediately without invoking the child.
    Drop,
}

/// Token bucket with continuous time-based refill.
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            burst,
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }
}

/// Admits calls at `rate` tokens per second with bursts up to `burst`.
///
/// In [`LimiterMode::Wait`] an over-rate call blocks until a token accrues
/// or the context is canceled; in [`LimiterMode::Drop`] it fails at once
/// with a rejection error and the child is never invoked.
pub struct RateLimiter<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    bucket: Mutex<TokenBucket>,
    mode: RwLock<LimiterMode>,
    clock: Arc<dyn Clock>,
    hooks: Hooks<LimiterEvent>,
    closed: AtomicBool,
}

impl<T: Payload> RateLimiter<T> {
    /// A limiter admitting `rate` calls per second with bursts up to
    /// `burst`, in [`LimiterMode::Wait`].
    pub fn new(
        name: impl Into<String>,
        child: DynChainable<T>,
        rate: f64,
        burst: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if rate <= 0.0 {
            return Err(ConfigError::NonPositiveRate(rate));
        }
        if burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        let now = clock.now();
        Ok(Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            bucket: Mutex::new(TokenBucket::new(rate, burst as f64, now)),
            mode: RwLock::new(LimiterMode::Wait),
            clock,
            hooks: Hooks::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate
    }

    /// Reconfigure the refill rate.
    pub fn set_rate(&self, rate: f64) -> Result<(), ConfigError> {
        if rate <= 0.0 {
            return Err(ConfigError::NonPositiveRate(rate));
        }
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);
        bucket.rate = rate;
        Ok(())
    }

    /// The bucket capacity.
    pub fn burst(&self) -> u32 {
        self.bucket.lock().burst as u32
    }

    /// Reconfigure the bucket capacity; accrued tokens are capped at the
    /// new burst.
    pub fn set_burst(&self, burst: u32) -> Result<(), ConfigError> {
        if burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);
        bucket.burst = burst as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
        Ok(())
    }

    /// The admission mode.
    pub fn mode(&self) -> LimiterMode {
        *self.mode.read()
    }

    /// Reconfigure the admission mode.
    pub fn set_mode(&self, mode: LimiterMode) {
        *self.mode.write() = mode;
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    /// Admission callbacks: drops and waits.
    pub fn hooks(&self) -> &Hooks<LimiterEvent> {
        &self.hooks
    }

    async fn admit(&self, ctx: &Context, input: &T) -> Result<(), PipelineError<T>> {
        let mode = *self.mode.read();
        let admit_started = self.clock.now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.try_consume(self.clock.now()) {
                    let waited = self.clock.since(admit_started);
                    if waited > Duration::ZERO {
                        self.hooks.emit(&LimiterEvent::Waited {
                            limiter: self.identity.name().to_string(),
                            delay: waited,
                        });
                    }
                    return Ok(());
                }
                bucket.wait_time()
            };

            match mode {
                LimiterMode::Drop => {
                    metrics::record_rejection(self.identity.name(), "rate_limit");
                    debug!(limiter = self.identity.name(), "dropping over-rate call");
                    self.hooks.emit(&LimiterEvent::Dropped {
                        limiter: self.identity.name().to_string(),
                    });
                    return Err(PipelineError::rejected(
                        self.identity.name(),
                        EXCEEDED_MESSAGE,
                    ));
                }
                LimiterMode::Wait => {
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = ctx.cancelled() => {
                            let cause = ctx.error().unwrap_or(crate::core::ContextError::Canceled);
                            return Err(PipelineError::from_context(
                                self.identity.name(),
                                cause,
                                Some(input.clone()),
                                self.clock.since(admit_started),
                            ));
                        }
                    }
                }
            }
        }
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

        self.admit(ctx, &input).await?;

        let child = self.child.read().clone();
        child
            .process(ctx, input)
            .await
            .map_err(|err| err.prepend(self.identity.name()))
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for RateLimiter<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("rate_limiter", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let (rate, burst) = {
            let bucket = self.bucket.lock();
            (bucket.rate, bucket.burst as u64)
        };
        Node::new(
            &self.identity,
            "rate_limiter",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata("rate", rate.into())
        .with_metadata("burst", burst.into())
        .with_metadata(
            "mode",
            match *self.mode.read() {
                LimiterMode::Wait => "wait".into(),
                LimiterMode::Drop => "drop".into(),
            },
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
