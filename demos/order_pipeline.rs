//! A small order-processing pipeline: validate, route by tier, enrich
//! best-effort, and audit on the side.
//!
//! Run with: cargo run --example order_pipeline

use pipeflow::connector::{Concurrent, Sequence, Switch};
use pipeflow::processor::{Apply, Effect, Enrich, Transform};
use pipeflow::{Chainable, Context};

#[derive(Debug, Clone)]
struct Order {
    id: u64,
    tier: String,
    total_cents: i64,
    tags: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let validate = Apply::new("validate", |_ctx, order: Order| async move {
        if order.total_cents <= 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "non-positive total",
            ))
        } else {
            Ok(order)
        }
    })
    .into_dyn();

    let router = Switch::new("tier-router", |_ctx, order: &Order| order.tier.clone());
    router.add_route(
        "premium".to_string(),
        Transform::new("expedite", |_ctx, mut order: Order| async move {
            order.tags.push("expedited".to_string());
            order
        })
        .into_dyn(),
    );
    router.add_route(
        "standard".to_string(),
        Transform::new("batch", |_ctx, mut order: Order| async move {
            order.tags.push("batched".to_string());
            order
        })
        .into_dyn(),
    );

    let loyalty = Enrich::new("loyalty-points", |_ctx, mut order: Order| async move {
        // A flaky decoration: failure here never fails the order.
        if order.id % 2 == 0 {
            return Err::<Order, _>(std::io::Error::new(
                std::io::ErrorKind::Other,
                "loyalty service offline",
            ));
        }
        order.tags.push("points-awarded".to_string());
        Ok(order)
    })
    .into_dyn();

    let audit = Concurrent::new(
        "audit",
        vec![Effect::new("ledger", |_ctx, order: Order| async move {
            println!("audit: order {} totals {} cents", order.id, order.total_cents);
            Ok::<_, std::io::Error>(())
        })
        .into_dyn()],
    )
    .into_dyn();

    let pipeline = Sequence::with_steps(
        "orders",
        vec![validate, router.into_dyn(), loyalty, audit],
    );

    println!("schema:\n{}", pipeline.schema().to_json()?);

    let ctx = Context::background();
    for order in [
        Order {
            id: 1,
            tier: "premium".to_string(),
            total_cents: 12_500,
            tags: Vec::new(),
        },
        Order {
            id: 2,
            tier: "standard".to_string(),
            total_cents: 900,
            tags: Vec::new(),
        },
    ] {
        let processed = pipeline.process(&ctx, order).await?;
        println!("processed: {processed:?}");
    }

    pipeline.close().await?;
    Ok(())
}
