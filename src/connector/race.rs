//! Fan-out with first-winner cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{
    recover, Chainable, Context, ContextError, DynChainable, ErrorCause, Identity, Payload,
    PipelineError,
};
use crate::observe::hooks::{Hooks, WinnerEvent};
use crate::observe::metrics;
use crate::schema::{Flow, Node};

type AcceptFn<T> = Arc<dyn Fn(&Context, &T) -> bool + Send + Sync>;

const NO_MATCH_MESSAGE: &str = "no processor results met the specified condition";

fn aggregate_failure<T>(name: &str, total: usize, last: Option<PipelineError<T>>) -> PipelineError<T> {
    PipelineError::new(
        name,
        ErrorCause::NoWinner {
            reason: format!("all {total} processors failed"),
            last: last.map(Box::new),
        },
        None,
        Duration::ZERO,
    )
}

struct RaceGroup<T> {
    child_ctx: Context,
    results: tokio::sync::mpsc::Receiver<(String, Result<T, PipelineError<T>>)>,
    total: usize,
}

/// Spawn every child on its own task with a cloned input. The result
/// channel is buffered to the child count so a loser finishing after
/// cancellation never blocks on send.
fn spawn_competitors<T: Payload>(
    ctx: &Context,
    children: Vec<DynChainable<T>>,
    input: &T,
) -> RaceGroup<T> {
    let total = children.len();
    let child_ctx = ctx.child();
    let (tx, results) = tokio::sync::mpsc::channel(total.max(1));

    for child in children {
        let task_ctx = child_ctx.clone();
        let task_input = input.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let name = child.name().to_string();
            let result = child.process(&task_ctx, task_input).await;
            let _ = tx.send((name, result)).await;
        });
    }

    RaceGroup {
        child_ctx,
        results,
        total,
    }
}

/// Races its children: the first child to return without error wins, its
/// result is returned, and the rest are canceled through a derived
/// context. When every child errors, an aggregate error is returned.
///
/// Ties go to whichever completion is observed first; the contract does
/// not promise which.
pub struct Race<T> {
    identity: Identity,
    children: RwLock<Vec<DynChainable<T>>>,
    on_winner: Hooks<WinnerEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Race<T> {
    /// A race over `children`.
    pub fn new(name: impl Into<String>, children: Vec<DynChainable<T>>) -> Self {
        Self {
            identity: Identity::new(name),
            children: RwLock::new(children),
            on_winner: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a competitor.
    pub fn add_competitor(&self, child: DynChainable<T>) {
        self.children.write().push(child);
    }

    /// Replace the whole competitor list.
    pub fn set_competitors(&self, children: Vec<DynChainable<T>>) {
        *self.children.write() = children;
    }

    /// Number of competitors.
    pub fn competitor_count(&self) -> usize {
        self.children.read().len()
    }

    /// Callbacks invoked when a winner emerges.
    pub fn on_winner(&self) -> &Hooks<WinnerEvent> {
        &self.on_winner
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

        let children = self.children.read().clone();
        if children.is_empty() {
            return Err(PipelineError::usage(
                self.identity.name(),
                "race requires at least one processor",
            ));
        }

        let mut group = spawn_competitors(ctx, children, &input);
        let mut failures = 0usize;
        let mut last_err = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    group.child_ctx.cancel();
                    metrics::record_race_outcome(self.identity.name(), "canceled");
                    let cause = ctx.error().unwrap_or(ContextError::Canceled);
                    return Err(PipelineError::from_context(
                        self.identity.name(),
                        cause,
                        Some(input),
                        Duration::ZERO,
                    ));
                }
                message = group.results.recv() => match message {
                    Some((child, Ok(output))) => {
                        group.child_ctx.cancel();
                        metrics::record_race_outcome(self.identity.name(), "winner");
                        debug!(race = self.identity.name(), winner = %child, "race won");
                        self.on_winner.emit(&WinnerEvent {
                            connector: self.identity.name().to_string(),
                            winner: child,
                        });
                        return Ok(output);
                    }
                    Some((_, Err(err))) => {
                        failures += 1;
                        last_err = Some(err);
                        if failures == group.total {
                            metrics::record_race_outcome(self.identity.name(), "no_winner");
                            return Err(aggregate_failure(self.identity.name(), group.total, last_err));
                        }
                    }
                    None => {
                        metrics::record_race_outcome(self.identity.name(), "no_winner");
                        return Err(aggregate_failure(self.identity.name(), group.total, last_err));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Race<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("race", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let competitors = self.children.read().iter().map(|c| c.schema()).collect();
        Node::new(&self.identity, "race", Some(Flow::Competitors { competitors }))
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

/// Like [`Race`], but a user-supplied predicate gates winning: the first
/// result the predicate accepts wins and cancels the rest. Results that
/// succeed without being accepted are discarded and the contest keeps
/// waiting.
///
/// When everything finishes without an accepted result, the error
/// distinguishes all-children-errored from none-met-the-condition.
pub struct Contest<T> {
    identity: Identity,
    children: RwLock<Vec<DynChainable<T>>>,
    condition: RwLock<Option<AcceptFn<T>>>,
    on_winner: Hooks<WinnerEvent>,
    closed: AtomicBool,
}

impl<T: Payload> Contest<T> {
    /// A contest over `children` with no condition yet. A contest without
    /// a condition fails at process time.
    pub fn new(name: impl Into<String>, children: Vec<DynChainable<T>>) -> Self {
        Self {
            identity: Identity::new(name),
            children: RwLock::new(children),
            condition: RwLock::new(None),
            on_winner: Hooks::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A contest with its winning condition supplied up front.
    pub fn with_condition<F>(
        name: impl Into<String>,
        condition: F,
        children: Vec<DynChainable<T>>,
    ) -> Self
    where
        F: Fn(&Context, &T) -> bool + Send + Sync + 'static,
    {
        let contest = Self::new(name, children);
        contest.set_condition(condition);
        contest
    }

    /// Install or replace the winning condition.
    pub fn set_condition<F>(&self, condition: F)
    where
        F: Fn(&Context, &T) -> bool + Send + Sync + 'static,
    {
        *self.condition.write() = Some(Arc::new(condition));
    }

    /// Append a competitor.
    pub fn add_competitor(&self, child: DynChainable<T>) {
        self.children.write().push(child);
    }

    /// Replace the whole competitor list.
    pub fn set_competitors(&self, children: Vec<DynChainable<T>>) {
        *self.children.write() = children;
    }

    /// Number of competitors.
    pub fn competitor_count(&self) -> usize {
        self.children.read().len()
    }

    /// Callbacks invoked when a winner emerges.
    pub fn on_winner(&self) -> &Hooks<WinnerEvent> {
        &self.on_winner
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

        let condition = match self.condition.read().clone() {
            Some(condition) => condition,
            None => {
                return Err(PipelineError::usage(
                    self.identity.name(),
                    "contest requires a winning condition",
                ))
            }
        };
        let children = self.children.read().clone();
        if children.is_empty() {
            return Err(PipelineError::usage(
                self.identity.name(),
                "contest requires at least one processor",
            ));
        }

        let mut group = spawn_competitors(ctx, children, &input);
        let mut finished = 0usize;
        let mut failures = 0usize;
        let mut last_err = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    group.child_ctx.cancel();
                    metrics::record_race_outcome(self.identity.name(), "canceled");
                    let cause = ctx.error().unwrap_or(ContextError::Canceled);
                    return Err(PipelineError::from_context(
                        self.identity.name(),
                        cause,
                        Some(input),
                        Duration::ZERO,
                    ));
                }
                message = group.results.recv() => {
                    match message {
                        Some((child, Ok(output))) => {
                            finished += 1;
                            if condition(ctx, &output) {
                                group.child_ctx.cancel();
                                metrics::record_race_outcome(self.identity.name(), "winner");
                                debug!(contest = self.identity.name(), winner = %child, "contest won");
                                self.on_winner.emit(&WinnerEvent {
                                    connector: self.identity.name().to_string(),
                                    winner: child,
                                });
                                return Ok(output);
                            }
                            debug!(
                                contest = self.identity.name(),
                                child = %child,
                                "result discarded by condition"
                            );
                        }
                        Some((_, Err(err))) => {
                            finished += 1;
                            failures += 1;
                            last_err = Some(err);
                        }
                        None => finished = group.total,
                    }

                    if finished >= group.total {
                        metrics::record_race_outcome(self.identity.name(), "no_winner");
                        return Err(if failures == group.total {
                            aggregate_failure(self.identity.name(), group.total, last_err)
                        } else {
                            PipelineError::new(
                                self.identity.name(),
                                ErrorCause::NoWinner {
                                    reason: NO_MATCH_MESSAGE.to_string(),
                                    last: last_err.map(Box::new),
                                },
                                None,
                                Duration::ZERO,
                            )
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Contest<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("contest", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let competitors = self.children.read().iter().map(|c| c.schema()).collect();
        Node::new(
            &self.identity,
            "contest",
            Some(Flow::Competitors { competitors }),
        )
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
