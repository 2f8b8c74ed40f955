use pipeflow::connector::{Fallback, Filter, Handle, Switch};
use pipeflow::processor::{Apply, Effect, Transform};
use pipeflow::testing::TrackingProcessor;
use pipeflow::{Chainable, Context, DynChainable, PipelineError};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: u64,
    tier: String,
    total_cents: i64,
    notes: Vec<String>,
}

impl Order {
    fn new(id: u64, tier: &str, total_cents: i64) -> Self {
        Self {
            id,
            tier: tier.to_string(),
            total_cents,
            notes: Vec::new(),
        }
    }
}

fn note(name: &'static str) -> DynChainable<Order> {
    Transform::new(name, move |_ctx, mut order: Order| async move {
        order.notes.push(name.to_string());
        order
    })
    .into_dyn()
}

/// Switch routes on a computed key and passes through on a miss.
#[tokio::test]
async fn test_switch_routing_on_struct_field() {
    let switch = Switch::new("tier-router", |_ctx, order: &Order| order.tier.clone());
    switch.add_route("premium".to_string(), note("expedite"));
    switch.add_route("standard".to_string(), note("batch"));

    let ctx = Context::background();
    let premium = switch
        .process(&ctx, Order::new(1, "premium", 10_000))
        .await
        .unwrap();
    assert_eq!(premium.notes, vec!["expedite"]);

    let unknown = switch
        .process(&ctx, Order::new(2, "unknown", 500))
        .await
        .unwrap();
    assert!(unknown.notes.is_empty());
}

/// Filter runs its child only when the predicate holds.
#[tokio::test]
async fn test_filter_predicate() {
    let filter = Filter::new(
        "big-orders",
        |_ctx, order: &Order| order.total_cents >= 10_000,
        note("audit"),
    );

    let ctx = Context::background();
    let big = filter
        .process(&ctx, Order::new(1, "standard", 25_000))
        .await
        .unwrap();
    assert_eq!(big.notes, vec!["audit"]);

    let small = filter
        .process(&ctx, Order::new(2, "standard", 100))
        .await
        .unwrap();
    assert!(small.notes.is_empty());
}

/// Fallback returns the first success across primary and backups.
#[tokio::test]
async fn test_fallback_ordering() {
    let primary_calls = Arc::new(TrackingProcessor::<Order>::new("primary").fail_first(u32::MAX));
    let backup1 = Arc::new(TrackingProcessor::<Order>::new("backup-1").fail_first(u32::MAX));
    let backup2 = Arc::new(TrackingProcessor::<Order>::new("backup-2"));

    let fallback = Fallback::new(
        "charge",
        primary_calls.clone() as DynChainable<Order>,
        vec![
            backup1.clone() as DynChainable<Order>,
            backup2.clone() as DynChainable<Order>,
        ],
    );

    let out = fallback
        .process(&Context::background(), Order::new(1, "standard", 100))
        .await
        .unwrap();
    assert_eq!(out.id, 1);
    assert_eq!(primary_calls.calls(), 1);
    assert_eq!(backup1.calls(), 1);
    assert_eq!(backup2.calls(), 1);
}

/// Handle transparency: the handler's own failure never replaces the
/// original error.
#[tokio::test]
async fn test_handle_transparency() {
    let observed = Arc::new(std::sync::Mutex::new(Option::<String>::None));
    let seen = observed.clone();
    let handler = Effect::new("release-reservation", move |_ctx, err: PipelineError<Order>| {
        let seen = seen.clone();
        async move {
            *seen.lock().unwrap() = Some(err.path_string());
            Err::<(), _>(std::io::Error::new(
                std::io::ErrorKind::Other,
                "release failed too",
            ))
        }
    })
    .into_dyn();

    let charge = Apply::new("charge", |_ctx, _order: Order| async move {
        Err::<Order, _>(std::io::Error::new(
            std::io::ErrorKind::Other,
            "card declined",
        ))
    })
    .into_dyn();

    let handle = Handle::new("payment", charge, handler);
    let err = handle
        .process(&Context::background(), Order::new(7, "standard", 4_200))
        .await
        .unwrap_err();

    assert_eq!(err.path, vec!["payment", "charge"]);
    assert!(err.to_string().contains("card declined"));
    assert_eq!(
        observed.lock().unwrap().as_deref(),
        Some("payment -> charge")
    );
}

/// A switch inside a fallback keeps the full dotted trail.
#[tokio::test]
async fn test_composed_routing_path() {
    let failing = Apply::new("flaky-route", |_ctx, _order: Order| async move {
        Err::<Order, _>(std::io::Error::new(std::io::ErrorKind::Other, "down"))
    })
    .into_dyn();

    let switch = Switch::new("router", |_ctx, _order: &Order| "only");
    switch.add_route("only", failing);

    let fallback = Fallback::new("resilient", switch.into_dyn(), vec![]);
    let err = fallback
        .process(&Context::background(), Order::new(1, "standard", 100))
        .await
        .unwrap_err();

    assert_eq!(err.path, vec!["resilient", "router", "flaky-route"]);
}
