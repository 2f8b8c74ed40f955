//! Injectable time source.
//!
//! Every connector that sleeps, waits, or measures elapsed time takes an
//! `Arc<dyn Clock>` so tests can drive time manually. Production code uses
//! [`SystemClock`]; tests use the fake clock from [`crate::testing`].

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// A source of monotonic time and cancel-free sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current monotonic instant.
    fn now(&self) -> Instant;

    /// Elapsed time since `earlier`.
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }

    /// Suspend for `duration`. Callers race this against context
    /// cancellation themselves.
    async fn sleep(&self, duration: Duration);
}

/// The real tokio-backed clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
