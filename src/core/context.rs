//! Cancelable execution context threaded through every process call.
//!
//! Stands in for the ambient cancellation a pipeline needs: contexts form a
//! tree, canceling a parent cancels every derived child, and the cause of
//! cancellation (explicit cancel vs. deadline) survives into the structured
//! error a connector returns.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Why a context stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was canceled explicitly.
    #[error("context canceled")]
    Canceled,

    /// A deadline attached to the context expired.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct ContextState {
    cause: Option<ContextError>,
    children: Vec<Weak<ContextInner>>,
}

struct ContextInner {
    state: Mutex<ContextState>,
    notify: Notify,
}

impl ContextInner {
    fn new() -> Self {
        Self {
            state: Mutex::new(ContextState {
                cause: None,
                children: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn cancel(self: &Arc<Self>, cause: ContextError) {
        let children = {
            let mut state = self.state.lock();
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause);
            std::mem::take(&mut state.children)
        };
        self.notify.notify_waiters();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(cause);
            }
        }
    }
}

/// A derivable, cancelable execution context.
///
/// Cloning a `Context` yields another handle to the same context; use
/// [`Context::child`] to derive a new one that is canceled when its parent
/// is. All blocking points in the library observe the context and return
/// promptly once it is canceled.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A root context that is never canceled unless [`Context::cancel`] is
    /// called on it.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner::new()),
        }
    }

    /// Derive a child context. Canceling the parent cancels the child with
    /// the parent's cause; canceling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        let child = Arc::new(ContextInner::new());
        {
            let mut state = self.inner.state.lock();
            if let Some(cause) = state.cause {
                child.state.lock().cause = Some(cause);
            } else {
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(Arc::downgrade(&child));
            }
        }
        Self { inner: child }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.inner.cancel(ContextError::Canceled);
    }

    pub(crate) fn cancel_with(&self, cause: ContextError) {
        self.inner.cancel(cause);
    }

    /// Whether the context has been canceled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cause.is_some()
    }

    /// The cancellation cause, if any.
    pub fn error(&self) -> Option<ContextError> {
        self.inner.state.lock().cause
    }

    /// Resolves once the context is canceled. Never resolves for a context
    /// that stays live.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cause", &self.error())
            .finish()
    }
}
