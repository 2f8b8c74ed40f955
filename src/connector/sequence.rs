//! Ordered fail-fast composition.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{recover, Chainable, ConfigError, Context, DynChainable, Identity, Payload, PipelineError};
use crate::schema::{Flow, Node};

/// Applies its steps left to right; the output of step *i* feeds step
/// *i + 1*. The first error halts processing and unwinds with this
/// sequence's name prepended to the path. An empty sequence is the identity
/// pipeline.
///
/// The step list may be reconfigured at runtime; `process` snapshots it
/// under a read lock, so concurrent mutation never exposes a half-applied
/// edit.
pub struct Sequence<T> {
    identity: Identity,
    steps: RwLock<Vec<DynChainable<T>>>,
    closed: AtomicBool,
}

impl<T: Payload> Sequence<T> {
    /// An empty sequence.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(name),
            steps: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A sequence with an initial step list.
    pub fn with_steps(name: impl Into<String>, steps: Vec<DynChainable<T>>) -> Self {
        let sequence = Self::new(name);
        *sequence.steps.write() = steps;
        sequence
    }

    /// Append a step at the tail.
    pub fn push_back(&self, step: DynChainable<T>) {
        self.steps.write().push(step);
    }

    /// Prepend a step at the head.
    pub fn push_front(&self, step: DynChainable<T>) {
        self.steps.write().insert(0, step);
    }

    /// Insert a step at `index`, shifting later steps right.
    pub fn insert(&self, index: usize, step: DynChainable<T>) -> Result<(), ConfigError> {
        let mut steps = self.steps.write();
        if index > steps.len() {
            return Err(ConfigError::IndexOutOfBounds {
                index,
                len: steps.len(),
            });
        }
        steps.insert(index, step);
        Ok(())
    }

    /// Remove and return the step at `index`.
    pub fn remove(&self, index: usize) -> Result<DynChainable<T>, ConfigError> {
        let mut steps = self.steps.write();
        if index >= steps.len() {
            return Err(ConfigError::IndexOutOfBounds {
                index,
                len: steps.len(),
            });
        }
        Ok(steps.remove(index))
    }

    /// Replace the whole step list atomically.
    pub fn set_steps(&self, steps: Vec<DynChainable<T>>) {
        *self.steps.write() = steps;
    }

    /// Index of the first step whose identity name is `name`.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.steps.read().iter().position(|s| s.name() == name)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.read().len()
    }

    /// Whether the sequence has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.read().is_empty()
    }

    /// Names of the steps in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
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

        let steps = self.steps.read().clone();
        let mut value = input;
        for step in steps {
            match step.process(ctx, value).await {
                Ok(next) => value = next,
                Err(err) => {
                    debug!(
                        sequence = self.identity.name(),
                        step = step.name(),
                        "sequence halted on error"
                    );
                    return Err(err.prepend(self.identity.name()));
                }
            }
        }
        Ok(value)
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Sequence<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("sequence", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let steps = self.steps.read().iter().map(|s| s.schema()).collect();
        Node::new(&self.identity, "sequence", Some(Flow::Steps { steps }))
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let steps = self.steps.read().clone();
        let mut first_err = None;
        for step in steps {
            if let Err(err) = step.close().await {
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
    use crate::processor::{Apply, Transform};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn trim() -> DynChainable<String> {
        Transform::new("trim", |_ctx, s: String| async move {
            s.trim().to_string()
        })
        .into_dyn()
    }

    fn upper() -> DynChainable<String> {
        Transform::new("upper", |_ctx, s: String| async move { s.to_uppercase() }).into_dyn()
    }

    #[tokio::test]
    async fn test_empty_sequence_is_identity() {
        let seq: Sequence<String> = Sequence::new("empty");
        let out = seq
            .process(&Context::background(), "  as-is  ".to_string())
            .await
            .unwrap();
        assert_eq!(out, "  as-is  ");
    }

    #[tokio::test]
    async fn test_steps_chain_left_to_right() {
        let seq = Sequence::with_steps("normalize", vec![trim(), upper()]);
        let out = seq
            .process(&Context::background(), "  hello world  ".to_string())
            .await
            .unwrap();
        assert_eq!(out, "HELLO WORLD");
    }

    #[tokio::test]
    async fn test_fail_fast_skips_later_steps() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let calls = later_calls.clone();

        let failing = Apply::new("boom", |_ctx, _s: String| async move {
            Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .into_dyn();
        let counting = Transform::new("counting", move |_ctx, s: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                s
            }
        })
        .into_dyn();

        let seq = Sequence::with_steps("s", vec![failing, counting]);
        let err = seq
            .process(&Context::background(), "x".to_string())
            .await
            .unwrap_err();

        assert_eq!(err.path, vec!["s", "boom"]);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runtime_mutation() {
        let seq = Sequence::with_steps("pipeline", vec![trim()]);
        seq.push_back(upper());
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.position_of("upper"), Some(1));

        seq.push_front(upper());
        assert_eq!(seq.step_names(), vec!["upper", "trim", "upper"]);

        let removed = seq.remove(0).unwrap();
        assert_eq!(removed.name(), "upper");

        assert!(matches!(
            seq.insert(9, trim()),
            Err(ConfigError::IndexOutOfBounds { .. })
        ));

        seq.set_steps(vec![]);
        assert!(seq.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let seq = Sequence::with_steps("pipeline", vec![trim()]);
        seq.close().await.unwrap();
        seq.close().await.unwrap();
    }
}
