//! Test support: a manually advanced clock and a call-tracking processor.
//!
//! Exported as a public module so integration tests and downstream users
//! can drive time-dependent connectors deterministically. Wall-clock
//! sleeps in tests are a smell; advance a [`FakeClock`] instead.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::clock::Clock;
use crate::core::{recover, Chainable, Context, Identity, Payload, PipelineError};
use crate::schema::Node;

struct Sleeper {
    deadline: Duration,
    waker: oneshot::Sender<()>,
}

struct FakeClockInner {
    base: Instant,
    offset: Duration,
    auto_advance: bool,
    sleepers: Vec<Sleeper>,
}

/// A clock that only moves when told to.
///
/// In manual mode, `sleep` parks the caller until [`FakeClock::advance`]
/// moves virtual time past its deadline; [`FakeClock::wait_for_sleepers`]
/// lets a test wait until the code under test is parked before advancing.
/// In auto mode, every `sleep` advances virtual time instantly, which
/// collapses a backoff schedule into one deterministic measurement.
pub struct FakeClock {
    inner: Mutex<FakeClockInner>,
    registered: Notify,
}

impl FakeClock {
    /// A manual fake clock.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeClockInner {
                base: Instant::now(),
                offset: Duration::ZERO,
                auto_advance: false,
                sleepers: Vec::new(),
            }),
            registered: Notify::new(),
        }
    }

    /// An auto-advancing fake clock: sleeps return immediately after
    /// moving virtual time forward.
    pub fn auto() -> Self {
        let clock = Self::new();
        clock.inner.lock().auto_advance = true;
        clock
    }

    /// Move virtual time forward, waking every sleeper whose deadline has
    /// passed.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut inner = self.inner.lock();
            inner.offset += duration;
            Self::take_due(&mut inner)
        };
        for sleeper in due {
            let _ = sleeper.waker.send(());
        }
    }

    /// Number of tasks currently parked in `sleep`. Sleeps abandoned by
    /// their caller (a canceled select branch) are not counted.
    pub fn sleeper_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sleepers.retain(|s| !s.waker.is_closed());
        inner.sleepers.len()
    }

    /// Wait until at least `count` tasks are parked in `sleep`.
    pub async fn wait_for_sleepers(&self, count: usize) {
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.sleeper_count() >= count {
                return;
            }
            notified.await;
        }
    }

    fn take_due(inner: &mut FakeClockInner) -> Vec<Sleeper> {
        let offset = inner.offset;
        inner.sleepers.retain(|s| !s.waker.is_closed());
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.sleepers)
            .into_iter()
            .partition(|s| s.deadline <= offset);
        inner.sleepers = pending;
        due
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let inner = self.inner.lock();
        inner.base + inner.offset
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        let receiver = {
            let mut inner = self.inner.lock();
            if inner.auto_advance {
                inner.offset += duration;
                let due = Self::take_due(&mut inner);
                drop(inner);
                for sleeper in due {
                    let _ = sleeper.waker.send(());
                }
                return;
            }
            let (waker, receiver) = oneshot::channel();
            let deadline = inner.offset + duration;
            inner.sleepers.push(Sleeper {
                deadline,
                waker,
            });
            receiver
        };

        self.registered.notify_waiters();
        let _ = receiver.await;
    }
}

/// A pass-through leaf that counts how often it runs, optionally failing
/// its first calls and optionally sleeping on an injected clock.
pub struct TrackingProcessor<T> {
    identity: Identity,
    calls: AtomicU32,
    completions: AtomicU32,
    fail_first: u32,
    error_message: String,
    delay: Option<(Arc<dyn Clock>, Duration)>,
    transform: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
}

impl<T: Payload> TrackingProcessor<T> {
    /// A pass-through that always succeeds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(name),
            calls: AtomicU32::new(0),
            completions: AtomicU32::new(0),
            fail_first: 0,
            error_message: "induced failure".to_string(),
            delay: None,
            transform: None,
        }
    }

    /// Fail the first `count` calls with the default message.
    pub fn fail_first(mut self, count: u32) -> Self {
        self.fail_first = count;
        self
    }

    /// Fail the first `count` calls with `message`.
    pub fn fail_first_with(mut self, count: u32, message: impl Into<String>) -> Self {
        self.fail_first = count;
        self.error_message = message.into();
        self
    }

    /// Sleep on `clock` for `delay` before completing, aborting promptly
    /// on cancellation.
    pub fn with_delay(mut self, clock: Arc<dyn Clock>, delay: Duration) -> Self {
        self.delay = Some((clock, delay));
        self
    }

    /// Apply `transform` to the input on success.
    pub fn with_transform(mut self, transform: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// How many times process was entered.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// How many times process ran to successful completion.
    pub fn completions(&self) -> u32 {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for TrackingProcessor<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(cause) = ctx.error() {
                return Err(PipelineError::from_context(
                    self.identity.name(),
                    cause,
                    Some(input),
                    Duration::ZERO,
                ));
            }

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some((clock, delay)) = &self.delay {
                tokio::select! {
                    _ = clock.sleep(*delay) => {}
                    _ = ctx.cancelled() => {
                        let cause = ctx.error().unwrap_or(crate::core::ContextError::Canceled);
                        return Err(PipelineError::from_context(
                            self.identity.name(),
                            cause,
                            Some(input),
                            Duration::ZERO,
                        ));
                    }
                }
            }

            if call <= self.fail_first {
                return Err(PipelineError::from_user(
                    self.identity.name(),
                    std::io::Error::new(std::io::ErrorKind::Other, self.error_message.clone()),
                    Some(input),
                    Duration::ZERO,
                ));
            }

            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(match &self.transform {
                Some(transform) => transform(input),
                None => input,
            })
        };
        recover::guard("tracking", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "tracking")
    }
}
