//! Fan-out of cloned inputs: wait-for-all and fire-and-forget.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::warn;

use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::observe::hooks::{ChildErrorEvent, Hooks};
use crate::schema::{Flow, Node};

/// Fans a clone of the input out to every child in parallel, waits for all
/// of them, and returns the *original* input unchanged.
///
/// Child errors are reported on the observability side-channel but never
/// fail the connector: Concurrent is for side-effects and enrichment that
/// must not block the main path.
pub struct Concurrent<T> {
    identity: Identity,
    children: RwLock<Vec<DynChainable<T>>>,
    on_child_error: Hooks<ChildErrorEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Concurrent<T> {
    /// A concurrent fan-out over `children`.
    pub fn new(name: impl Into<String>, children: Vec<DynChainable<T>>) -> Self {
        Self {
            identity: Identity::new(name),
            children: RwLock::new(children),
            on_child_error: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a child.
    pub fn add_child(&self, child: DynChainable<T>) {
        self.children.write().push(child);
    }

    /// Replace the whole child list.
    pub fn set_children(&self, children: Vec<DynChainable<T>>) {
        *self.children.write() = children;
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Callbacks invoked when a child fails.
    pub fn on_child_error(&self) -> &Hooks<ChildErrorEvent> {
        &self.on_child_error
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

        let children = self.children.read().clone();
        let tasks: Vec<_> = children
            .iter()
            .map(|child| {
                let child = child.clone();
                let task_ctx = ctx.clone();
                let task_input = input.clone();
                tokio::spawn(async move {
                    let name = child.name().to_string();
                    (name, child.process(&task_ctx, task_input).await)
                })
            })
            .collect();

        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((child, Err(err))) => {
                    warn!(
                        concurrent = self.identity.name(),
                        child = %child, error = %err, "concurrent child failed"
                    );
                    self.on_child_error.emit(&ChildErrorEvent {
                        connector: self.identity.name().to_string(),
                        child,
                        error: err.to_string(),
                    });
                }
                Err(join_err) => {
                    warn!(
                        concurrent = self.identity.name(),
                        error = %join_err, "concurrent child task aborted"
                    );
                }
            }
        }

        Ok(input)
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Concurrent<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("concurrent", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let tasks = self.children.read().iter().map(|c| c.schema()).collect();
        Node::new(&self.identity, "concurrent", Some(Flow::Tasks { tasks }))
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let children = self.children.read().clone();
        let mut first_err = None;
        for child in children {
            if let Err(err) = child.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.prepend(self.identity.name())),
            None => Ok(()),
        }
    }
}

/// The fire-and-forget variant of [`Concurrent`]: clones are dispatched to
/// background tasks and the original input is returned immediately.
///
/// The tasks observe a context derived from the caller's, so canceling the
/// caller still winds the background work down.
pub struct Scaffold<T> {
    identity: Identity,
    children: RwLock<Vec<DynChainable<T>>>,
    on_child_error: Hooks<ChildErrorEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Scaffold<T> {
    /// A fire-and-forget fan-out over `children`.
    pub fn new(name: impl Into<String>, children: Vec<DynChainable<T>>) -> Self {
        Self {
            identity: Identity::new(name),
            children: RwLock::new(children),
            on_child_error: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a child.
    pub fn add_child(&self, child: DynChainable<T>) {
        self.children.write().push(child);
    }

    /// Replace the whole child list.
    pub fn set_children(&self, children: Vec<DynChainable<T>>) {
        *self.children.write() = children;
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Callbacks invoked (on the background task) when a child fails.
    pub fn on_child_error(&self) -> &Hooks<ChildErrorEvent> {
        &self.on_child_error
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

        let children = self.children.read().clone();
        let connector = self.identity.name().to_string();
        for child in children {
            let task_ctx = ctx.child();
            let task_input = input.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                let name = child.name().to_string();
                if let Err(err) = child.process(&task_ctx, task_input).await {
                    warn!(scaffold = %connector, child = %name, error = %err, "scaffold child failed");
                }
            });
        }

        Ok(input)
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Scaffold<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("scaffold", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let tasks = self.children.read().iter().map(|c| c.schema()).collect();
        Node::new(&self.identity, "scaffold", Some(Flow::Tasks { tasks }))
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let children = self.children.read().clone();
        let mut first_err = None;
        for child in children {
            if let Err(err) = child.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.prepend(self.identity.name())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Apply, Effect, Transform};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_returns_original_input() {
        let mutator =
            Transform::new("mutator", |_ctx, mut v: Vec<i32>| async move {
                v.push(99);
                v
            })
            .into_dyn();

        let concurrent = Concurrent::new("fan", vec![mutator]);
        let out = concurrent
            .process(&Context::background(), vec![1, 2])
            .await
            .unwrap();
        // The child mutated its own clone, not the original.
        assert_eq!(out, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_waits_for_all_children() {
        let seen = Arc::new(AtomicUsize::new(0));
        let children: Vec<DynChainable<i32>> = (0..3)
            .map(|i| {
                let seen = seen.clone();
                Effect::new(format!("side-{i}"), move |_ctx, _n: i32| {
                    let seen = seen.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, std::io::Error>(())
                    }
                })
                .into_dyn()
            })
            .collect();

        let concurrent = Concurrent::new("fan", children);
        concurrent.process(&Context::background(), 1).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_child_error_does_not_fail() {
        let failing = Apply::new("broken", |_ctx, _n: i32| async move {
            Err::<i32, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .into_dyn();

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let concurrent = Concurrent::new("fan", vec![failing]);
        concurrent.on_child_error().subscribe(move |event| {
            assert_eq!(event.child, "broken");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let out = concurrent.process(&Context::background(), 5).await.unwrap();
        assert_eq!(out, 5);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scaffold_returns_before_children_finish() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let slow = Effect::new("slow", move |_ctx, _n: i32| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            }
        })
        .into_dyn();

        let scaffold = Scaffold::new("bg", vec![slow]);
        let out = scaffold.process(&Context::background(), 1).await.unwrap();
        assert_eq!(out, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scaffold_children_observe_caller_cancellation() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let waiting = Effect::new("waiting", move |ctx: Context, _n: i32| {
            let counter = counter.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = ctx.cancelled() => {}
                }
                Ok::<_, std::io::Error>(())
            }
        })
        .into_dyn();

        let ctx = Context::background();
        let scaffold = Scaffold::new("bg", vec![waiting]);
        scaffold.process(&ctx, 1).await.unwrap();

        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }
}
