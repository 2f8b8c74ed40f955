//! Three-state failure shedding.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::observe::hooks::{BreakerEvent, Hooks};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

const OPEN_MESSAGE: &str = "circuit breaker is open";

/// Where the breaker currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Traffic passes; consecutive failures are counted.
    Closed,
    /// Traffic is rejected without invoking the child.
    Open,
    /// Probe traffic passes; successes close the breaker, any failure
    /// reopens it.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::Open => f.write_str("open"),
            BreakerState::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_fail: Option<Instant>,
    generation: u64,
}

/// Sheds load when the child keeps failing.
///
/// Closed counts consecutive failures and opens at the threshold. Open
/// rejects immediately until `reset_timeout` has elapsed since the last
/// failure, then admits probes as HalfOpen. Enough consecutive probe
/// successes close the breaker; any probe failure reopens it.
///
/// Every state reset bumps a generation counter. In-flight calls capture
/// the generation at dispatch; a call that comes back under a different
/// generation cannot mutate post-reset state.
pub struct CircuitBreaker<T> {
    identity: Identity,
    child: RwLock<DynChainable<T>>,
    config: RwLock<BreakerConfig>,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    hooks: Hooks<BreakerEvent>,
    closed: AtomicBool,
}

impl<T: Payload> CircuitBreaker<T> {
    /// A breaker over `child`. Thresholds of zero are clamped to one.
    pub fn new(
        name: impl Into<String>,
        child: DynChainable<T>,
        failure_threshold: u32,
        reset_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: Identity::new(name),
            child: RwLock::new(child),
            config: RwLock::new(BreakerConfig {
                failure_threshold: failure_threshold.max(1),
                success_threshold: 1,
                reset_timeout,
            }),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_fail: None,
                generation: 0,
            }),
            clock,
            hooks: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// The current generation counter.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Consecutive failures needed to open the breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.config.read().failure_threshold
    }

    /// Reconfigure the failure threshold; zero is clamped to one.
    pub fn set_failure_threshold(&self, threshold: u32) {
        self.config.write().failure_threshold = threshold.max(1);
    }

    /// Probe successes needed to close the breaker from HalfOpen.
    pub fn success_threshold(&self) -> u32 {
        self.config.read().success_threshold
    }

    /// Reconfigure the success threshold; zero is clamped to one.
    pub fn set_success_threshold(&self, threshold: u32) {
        self.config.write().success_threshold = threshold.max(1);
    }

    /// How long the breaker stays open before admitting probes.
    pub fn reset_timeout(&self) -> Duration {
        self.config.read().reset_timeout
    }

    /// Reconfigure the open interval.
    pub fn set_reset_timeout(&self, reset_timeout: Duration) {
        self.config.write().reset_timeout = reset_timeout;
    }

    /// Replace the wrapped child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
    }

    /// Breaker lifecycle callbacks: transitions and rejections.
    pub fn hooks(&self) -> &Hooks<BreakerEvent> {
        &self.hooks
    }

    /// Force the breaker Closed and invalidate in-flight calls.
    pub fn reset(&self) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = BreakerState::Closed;
            inner.failures = 0;
            inner.successes = 0;
            inner.last_fail = None;
            inner.generation += 1;
            from
        };
        if from != BreakerState::Closed {
            self.announce_transition(from, BreakerState::Closed);
        }
    }

    fn announce_transition(&self, from: BreakerState, to: BreakerState) {
        metrics::record_breaker_transition(&from.to_string(), &to.to_string());
        info!(breaker = self.identity.name(), %from, %to, "circuit breaker transition");
        self.hooks.emit(&BreakerEvent::Transition {
            breaker: self.identity.name().to_string(),
            from,
            to,
        });
    }

    /// Admission decision. Returns the generation to tag the call with, or
    /// `None` when the call must be rejected.
    fn admit(&self) -> Option<u64> {
        let reset_timeout = self.config.read().reset_timeout;
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Some(inner.generation),
            BreakerState::Open => {
                let waited_out = inner
                    .last_fail
                    .map(|at| self.clock.since(at) > reset_timeout)
                    .unwrap_or(true);
                if !waited_out {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.generation += 1;
                inner.failures = 0;
                inner.successes = 0;
                let generation = inner.generation;
                drop(inner);
                self.announce_transition(BreakerState::Open, BreakerState::HalfOpen);
                Some(generation)
            }
        }
    }

    fn record_success(&self, generation: u64) {
        let success_threshold = self.config.read().success_threshold;
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.state {
                BreakerState::Closed => {
                    inner.failures = 0;
                    None
                }
                BreakerState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= success_threshold {
                        inner.state = BreakerState::Closed;
                        inner.failures = 0;
                        inner.successes = 0;
                        Some((BreakerState::HalfOpen, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                BreakerState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            self.announce_transition(from, to);
        }
    }

    fn record_failure(&self, generation: u64) {
        let failure_threshold = self.config.read().failure_threshold;
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.state {
                BreakerState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.last_fail = Some(now);
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Open;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.last_fail = Some(now);
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Open => {
                    inner.last_fail = Some(now);
                    None
                }
            }
        };
        if let Some((from, to)) = transition {
            self.announce_transition(from, to);
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

        let generation = match self.admit() {
            Some(generation) => generation,
            None => {
                metrics::record_rejection(self.identity.name(), "circuit_open");
                warn!(breaker = self.identity.name(), "rejecting call while open");
                self.hooks.emit(&BreakerEvent::Rejected {
                    breaker: self.identity.name().to_string(),
                });
                return Err(PipelineError::rejected(self.identity.name(), OPEN_MESSAGE));
            }
        };

        let child = self.child.read().clone();
        match child.process(ctx, input).await {
            Ok(output) => {
                self.record_success(generation);
                Ok(output)
            }
            Err(err) => {
                self.record_failure(generation);
                Err(err.prepend(self.identity.name()))
            }
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for CircuitBreaker<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("circuit_breaker", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let config = *self.config.read();
        Node::new(
            &self.identity,
            "circuit_breaker",
            Some(Flow::Processor {
                processor: Box::new(self.child.read().schema()),
                error_handler: None,
            }),
        )
        .with_metadata("failure_threshold", config.failure_threshold.into())
        .with_metadata("success_threshold", config.success_threshold.into())
        .with_metadata(
            "reset_timeout_ms",
            (config.reset_timeout.as_millis() as u64).into(),
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
