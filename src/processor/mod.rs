//! Leaf processors: thin adapters lifting user functions into the
//! [`Chainable`] contract.
//!
//! Five shapes cover the useful space: [`Transform`] for infallible
//! rewrites, [`Apply`] for fallible ones, [`Effect`] for side-effects that
//! pass the value through, [`Mutate`] for conditional rewrites, and
//! [`Enrich`] for best-effort decoration that must never fail the pipeline.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::core::{recover, Chainable, Context, DynError, Identity, Payload, PipelineError};
use crate::observe::hooks::{ChildErrorEvent, Hooks};
use crate::schema::Node;

type BoxedTransformFn<T> = Box<dyn Fn(Context, T) -> BoxFuture<'static, T> + Send + Sync>;
type BoxedApplyFn<T> =
    Box<dyn Fn(Context, T) -> BoxFuture<'static, Result<T, DynError>> + Send + Sync>;
type BoxedEffectFn<T> =
    Box<dyn Fn(Context, T) -> BoxFuture<'static, Result<(), DynError>> + Send + Sync>;
type BoxedPredicate<T> = Box<dyn Fn(&Context, &T) -> bool + Send + Sync>;

fn check_cancelled<T: Payload>(name: &str, ctx: &Context, input: &T) -> Option<PipelineError<T>> {
    ctx.error()
        .map(|cause| PipelineError::from_context(name, cause, Some(input.clone()), std::time::Duration::ZERO))
}

/// An infallible rewrite of the value.
pub struct Transform<T> {
    identity: Identity,
    func: BoxedTransformFn<T>,
}

impl<T: Payload> Transform<T> {
    /// Lift an infallible async function into a chainable.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            identity: Identity::new(name),
            func: Box::new(move |ctx, input| -> BoxFuture<'static, T> {
                Box::pin(func(ctx, input))
            }),
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Transform<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(err) = check_cancelled(self.identity.name(), ctx, &input) {
                return Err(err);
            }
            Ok((self.func)(ctx.clone(), input).await)
        };
        recover::guard("transform", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "transform")
    }
}

/// A fallible rewrite of the value. User errors are wrapped into a
/// structured error rooted at this leaf.
pub struct Apply<T> {
    identity: Identity,
    func: BoxedApplyFn<T>,
}

impl<T: Payload> Apply<T> {
    /// Lift a fallible async function into a chainable.
    pub fn new<F, Fut, E>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<DynError>,
    {
        Self {
            identity: Identity::new(name),
            func: Box::new(
                move |ctx, input| -> BoxFuture<'static, Result<T, DynError>> {
                    let fut = func(ctx, input);
                    Box::pin(async move { fut.await.map_err(Into::into) })
                },
            ),
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Apply<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(err) = check_cancelled(self.identity.name(), ctx, &input) {
                return Err(err);
            }
            let started = Instant::now();
            let original = input.clone();
            match (self.func)(ctx.clone(), input).await {
                Ok(output) => Ok(output),
                Err(err) => Err(PipelineError::from_user(
                    self.identity.name(),
                    err,
                    Some(original),
                    started.elapsed(),
                )),
            }
        };
        recover::guard("apply", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "apply")
    }
}

/// A side-effect that passes the value through unchanged on success and
/// fails the pipeline on error.
pub struct Effect<T> {
    identity: Identity,
    func: BoxedEffectFn<T>,
}

impl<T: Payload> Effect<T> {
    /// Lift a side-effecting async function into a chainable.
    pub fn new<F, Fut, E>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<DynError>,
    {
        Self {
            identity: Identity::new(name),
            func: Box::new(
                move |ctx, input| -> BoxFuture<'static, Result<(), DynError>> {
                    let fut = func(ctx, input);
                    Box::pin(async move { fut.await.map_err(Into::into) })
                },
            ),
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Effect<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(err) = check_cancelled(self.identity.name(), ctx, &input) {
                return Err(err);
            }
            let started = Instant::now();
            match (self.func)(ctx.clone(), input.clone()).await {
                Ok(()) => Ok(input),
                Err(err) => Err(PipelineError::from_user(
                    self.identity.name(),
                    err,
                    Some(input),
                    started.elapsed(),
                )),
            }
        };
        recover::guard("effect", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "effect")
    }
}

/// A conditional rewrite: the transform runs only when the predicate holds,
/// otherwise the value passes through untouched.
pub struct Mutate<T> {
    identity: Identity,
    condition: BoxedPredicate<T>,
    func: BoxedTransformFn<T>,
}

impl<T: Payload> Mutate<T> {
    /// Lift a predicate plus transform into a chainable.
    pub fn new<P, F, Fut>(name: impl Into<String>, condition: P, func: F) -> Self
    where
        P: Fn(&Context, &T) -> bool + Send + Sync + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            identity: Identity::new(name),
            condition: Box::new(condition),
            func: Box::new(move |ctx, input| -> BoxFuture<'static, T> {
                Box::pin(func(ctx, input))
            }),
        }
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Mutate<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(err) = check_cancelled(self.identity.name(), ctx, &input) {
                return Err(err);
            }
            if !(self.condition)(ctx, &input) {
                return Ok(input);
            }
            Ok((self.func)(ctx.clone(), input).await)
        };
        recover::guard("mutate", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "mutate")
    }
}

/// A best-effort rewrite: on user error the original value passes through
/// unchanged and the failure is reported on the side-channel only.
pub struct Enrich<T> {
    identity: Identity,
    func: BoxedApplyFn<T>,
    on_error: Hooks<ChildErrorEvent>,
}

impl<T: Payload> Enrich<T> {
    /// Lift a fallible decoration into a chainable that never fails.
    pub fn new<F, Fut, E>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<DynError>,
    {
        Self {
            identity: Identity::new(name),
            func: Box::new(
                move |ctx, input| -> BoxFuture<'static, Result<T, DynError>> {
                    let fut = func(ctx, input);
                    Box::pin(async move { fut.await.map_err(Into::into) })
                },
            ),
            on_error: Hooks::new(),
        }
    }

    /// Callbacks invoked when the decoration fails and is skipped.
    pub fn on_error(&self) -> &Hooks<ChildErrorEvent> {
        &self.on_error
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Enrich<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        let run = async {
            if let Some(err) = check_cancelled(self.identity.name(), ctx, &input) {
                return Err(err);
            }
            let original = input.clone();
            match (self.func)(ctx.clone(), input).await {
                Ok(output) => Ok(output),
                Err(err) => {
                    warn!(name = self.identity.name(), error = %err, "enrichment skipped");
                    self.on_error.emit(&ChildErrorEvent {
                        connector: self.identity.name().to_string(),
                        child: self.identity.name().to_string(),
                        error: err.to_string(),
                    });
                    Ok(original)
                }
            }
        };
        recover::guard("enrich", self.identity.name(), run).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        Node::leaf(&self.identity, "enrich")
    }
}
