//! Data-driven routing and gating.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{recover, Chainable, Context, DynChainable, Identity, Payload, PipelineError};
use crate::schema::{Flow, Node};

type KeyFn<T, K> = Arc<dyn Fn(&Context, &T) -> K + Send + Sync>;
type PredicateFn<T> = Arc<dyn Fn(&Context, &T) -> bool + Send + Sync>;

/// Routes the value to the child registered under the computed key.
///
/// A key with no registered route is not a failure: the value passes
/// through unchanged. Keys may be any equality-comparable type; `Display`
/// is required so routes can be rendered in the schema.
pub struct Switch<T, K> {
    identity: Identity,
    key_fn: RwLock<KeyFn<T, K>>,
    routes: RwLock<HashMap<K, DynChainable<T>>>,
    closed: AtomicBool,
}

impl<T, K> Switch<T, K>
where
    T: Payload,
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    /// A switch with a keying function and no routes.
    pub fn new<F>(name: impl Into<String>, key_fn: F) -> Self
    where
        F: Fn(&Context, &T) -> K + Send + Sync + 'static,
    {
        Self {
            identity: Identity::new(name),
            key_fn: RwLock::new(Arc::new(key_fn)),
            routes: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register (or replace) the child for `key`.
    pub fn add_route(&self, key: K, child: DynChainable<T>) {
        self.routes.write().insert(key, child);
    }

    /// Remove the child for `key`, returning it when present.
    pub fn remove_route(&self, key: &K) -> Option<DynChainable<T>> {
        self.routes.write().remove(key)
    }

    /// Drop every route.
    pub fn clear_routes(&self) {
        self.routes.write().clear();
    }

    /// Replace the keying function.
    pub fn set_key_fn<F>(&self, key_fn: F)
    where
        F: Fn(&Context, &T) -> K + Send + Sync + 'static,
    {
        *self.key_fn.write() = Arc::new(key_fn);
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// The registered keys, unordered.
    pub fn route_keys(&self) -> Vec<K> {
        self.routes.read().keys().cloned().collect()
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

        let key_fn = self.key_fn.read().clone();
        let key = key_fn(ctx, &input);
        let route = self.routes.read().get(&key).cloned();

        match route {
            Some(child) => child
                .process(ctx, input)
                .await
                .map_err(|err| err.prepend(self.identity.name())),
            None => {
                debug!(switch = self.identity.name(), key = %key, "no route; passing through");
                Ok(input)
            }
        }
    }
}

#[async_trait]
impl<T, K> Chainable<T> for Switch<T, K>
where
    T: Payload,
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("switch", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let routes = self
            .routes
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.schema()))
            .collect();
        Node::new(&self.identity, "switch", Some(Flow::Routes { routes }))
    }

    async fn close(&self) -> Result<(), PipelineError<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let children: Vec<_> = self.routes.read().values().cloned().collect();
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

/// Gates one child behind a predicate: when the predicate holds the child
/// runs, otherwise the value passes through unchanged.
pub struct Filter<T> {
    identity: Identity,
    predicate: RwLock<PredicateFn<T>>,
    child: RwLock<DynChainable<T>>,
    closed: AtomicBool,
}

impl<T: Payload> Filter<T> {
    /// A filter over `child`.
    pub fn new<P>(name: impl Into<String>, predicate: P, child: DynChainable<T>) -> Self
    where
        P: Fn(&Context, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            identity: Identity::new(name),
            predicate: RwLock::new(Arc::new(predicate)),
            child: RwLock::new(child),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the predicate.
    pub fn set_predicate<P>(&self, predicate: P)
    where
        P: Fn(&Context, &T) -> bool + Send + Sync + 'static,
    {
        *self.predicate.write() = Arc::new(predicate);
    }

    /// Replace the gated child.
    pub fn set_child(&self, child: DynChainable<T>) {
        *self.child.write() = child;
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

        let predicate = self.predicate.read().clone();
        if !predicate(ctx, &input) {
            return Ok(input);
        }

        let child = self.child.read().clone();
        child
            .process(ctx, input)
            .await
            .map_err(|err| err.prepend(self.identity.name()))
    }
}

#[async_trait]
impl<T: Payload> Chainable<T> for Filter<T> {
    async fn process(&self, ctx: &Context, input: T) -> Result<T, PipelineError<T>> {
        recover::guard("filter", self.identity.name(), self.run(ctx, input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> Node {
        let child = self.child.read().schema();
        Node::new(
            &self.identity,
            "filter",
            Some(Flow::Processor {
                processor: Box::new(child),
                error_handler: None,
            }),
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
