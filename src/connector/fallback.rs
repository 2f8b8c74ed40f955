//! Primary with ordered backups.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::schema::{Flow, Node};

/// Tries the primary; on error, tries each backup in order until one
/// succeeds. The first success wins; when everything fails the last error
/// is returned with this connector's name prepended.
///
/// A canceled context short-circuits immediately: cancellation is not a
/// failure another backup should compensate for.
pub struct Fallback<T> {
    identity: Identity,
    primary: RwLock<DynChainable<T>>,
    backups: RwLock<Vec<DynChainable<T>>>,
    closed: AtomicBool,
}

impl<T: Payload> Fallback<T> {
    /// A fallback over `primary` with ordered `backups`.
    pub fn new(
        name: impl Into<String>,
        primary: DynChainable<T>,
        backups: Vec<DynChainable<T>>,
    ) -> Self {
        Self {
            identity: Identity::new(name),
            primary: RwLock::new(primary),
            backups: RwLock::new(backups),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the primary.
    pub fn set_primary(&self, primary: DynChainable<T>) {
        *self.primary.write() = primary;
    }

    /// Append a backup at the end of the order.
    pub fn add_backup(&self, backup: DynChainable<T>) {
        self.backups.write().push(backup);
    }

    /// Replace the whole backup list.
    pub fn set_backups(&self, backups: Vec<DynChainable<T>>) {
        *self.backups.write() = backups;
    }

    /// Number of backups.
    pub fn backup_count(&self) -> usize {
        self.backups.read().len()
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

        let primary = self.primary.read().clone();
        let backups = self.backups.read().clone();

        let mut last_err = match primary.process(ctx, input.clone()).await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };

        for backup in backups {
            if last_err.is_canceled() || ctx.is_cancelled() {
                break;
            }
            debug!(
                fallback = self.identity.name(),
                backup = backup.name(),
                "primary failed; trying backup"
            );
            match backup.process(ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => last_err = err,
            }
        }

        Err(last_err.prepend(self.identity.name()))
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Fallback<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("fallback", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let primary = Box::new(self.primary.read().schema());
        let backups = self.backups.read().iter().map(|b| b.schema()).collect();
        Node::new(
            &self.identity,
            "fallback",
            Some(Flow::Fallback { primary, backups }),
        )
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut children = vec![self.primary.read().clone()];
        children.extend(self.backups.read().iter().cloned());
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
    use crate::processor::{Apply, Transform};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn failing(name: &str) -> DynChainable<String> {
        Apply::new(name, |_ctx, _s: String| async move {
            Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "down"))
        })
        .into_dyn()
    }

    fn succeeding(name: &'static str) -> DynChainable<String> {
        Transform::new(name, move |_ctx, s: String| async move {
            format!("{s}:{name}")
        })
        .into_dyn()
    }

    #[tokio::test]
    async fn test_primary_success_skips_backups() {
        let backup_calls = Arc::new(AtomicUsize::new(0));
        let calls = backup_calls.clone();
        let backup = Transform::new("backup", move |_ctx, s: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                s
            }
        })
        .into_dyn();

        let fallback = Fallback::new("ship", succeeding("primary"), vec![backup]);
        let out = fallback
            .process(&Context::background(), "pkg".to_string())
            .await
            .unwrap();

        assert_eq!(out, "pkg:primary");
        assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backups_tried_in_order() {
        let fallback = Fallback::new(
            "ship",
            failing("primary"),
            vec![failing("backup-1"), succeeding("backup-2")],
        );
        let out = fallback
            .process(&Context::background(), "pkg".to_string())
            .await
            .unwrap();
        assert_eq!(out, "pkg:backup-2");
    }

    #[tokio::test]
    async fn test_all_failing_returns_last_error() {
        let fallback = Fallback::new(
            "ship",
            failing("primary"),
            vec![failing("backup-1"), failing("backup-2")],
        );
        let err = fallback
            .process(&Context::background(), "pkg".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.path, vec!["ship", "backup-2"]);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_backups() {
        let backup_calls = Arc::new(AtomicUsize::new(0));
        let calls = backup_calls.clone();
        let backup = Transform::new("backup", move |_ctx, s: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                s
            }
        })
        .into_dyn();

        let ctx = Context::background();
        let canceler = ctx.clone();
        let primary = Apply::new("primary", move |_ctx, _s: String| {
            let canceler = canceler.clone();
            async move {
                canceler.cancel();
                Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "mid-flight"))
            }
        })
        .into_dyn();

        let fallback = Fallback::new("ship", primary, vec![backup]);
        let err = fallback.process(&ctx, "pkg".to_string()).await.unwrap_err();

        assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.path[0], "ship");
    }
}
