//! Per-instance callback registration.
//!
//! Connectors expose a [`Hooks`] bus per event family. Emission is
//! synchronous, takes a snapshot of the subscriber list, and is a cheap
//! no-op when nobody subscribed; it never blocks or reorders the main
//! process path, so callbacks must be fast and must not panic.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::connector::circuit_breaker::BreakerState;

/// A list of subscribers for one event type.
pub struct Hooks<E> {
    subscribers: RwLock<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> Hooks<E> {
    /// An empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback. Callbacks run on the emitting task.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        self.subscribers.write().push(Arc::new(callback));
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Invoke every subscriber with `event`.
    pub fn emit(&self, event: &E) {
        let snapshot = {
            let subscribers = self.subscribers.read();
            if subscribers.is_empty() {
                return;
            }
            subscribers.clone()
        };
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<E> Default for Hooks<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker lifecycle events.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// The breaker moved between states.
    Transition {
        /// The breaker's name.
        breaker: String,
        /// The state left behind.
        from: BreakerState,
        /// The state entered.
        to: BreakerState,
    },

    /// A call was refused without invoking the child.
    Rejected {
        /// The breaker's name.
        breaker: String,
    },
}

/// One failed attempt inside Retry or Backoff.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    /// The retrying connector's name.
    pub connector: String,
    /// 1-indexed attempt that just failed.
    pub attempt: u32,
    /// The configured attempt budget.
    pub max_attempts: u32,
    /// Rendered child error.
    pub error: String,
}

/// A racing group produced a winner.
#[derive(Debug, Clone)]
pub struct WinnerEvent {
    /// The racing connector's name.
    pub connector: String,
    /// The winning child's name.
    pub winner: String,
}

/// A fan-out child failed without failing the connector.
#[derive(Debug, Clone)]
pub struct ChildErrorEvent {
    /// The fan-out connector's name.
    pub connector: String,
    /// The failing child's name.
    pub child: String,
    /// Rendered child error.
    pub error: String,
}

/// Rate limiter admission outcomes.
#[derive(Debug, Clone)]
pub enum LimiterEvent {
    /// A call was dropped with no token available.
    Dropped {
        /// The limiter's name.
        limiter: String,
    },

    /// A call waited for a token before proceeding.
    Waited {
        /// The limiter's name.
        limiter: String,
        /// How long the call waited.
        delay: Duration,
    },
}
