//! A resilience stack around a flaky upstream: timeout, backoff, circuit
//! breaker, and a race between mirrors.
//!
//! Run with: cargo run --example resilient_fetch

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipeflow::connector::{Backoff, CircuitBreaker, Race, Timeout};
use pipeflow::observe::hooks::BreakerEvent;
use pipeflow::processor::{Apply, Transform};
use pipeflow::{Chainable, Context, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let clock = Arc::new(SystemClock);

    // An upstream that fails its first two calls, then recovers.
    let failures = Arc::new(AtomicU32::new(0));
    let upstream = Apply::new("upstream", move |_ctx, url: String| {
        let failures = failures.clone();
        async move {
            if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ))
            } else {
                Ok(format!("{url} -> 200 OK"))
            }
        }
    })
    .into_dyn();

    let with_backoff = Backoff::new(
        "backoff",
        upstream,
        4,
        Duration::from_millis(25),
        clock.clone(),
    )
    .into_dyn();

    let breaker = CircuitBreaker::new(
        "breaker",
        with_backoff,
        5,
        Duration::from_secs(10),
        clock.clone(),
    );
    breaker.hooks().subscribe(|event| {
        if let BreakerEvent::Transition { from, to, .. } = event {
            println!("breaker: {from} -> {to}");
        }
    });

    let guarded = Timeout::new(
        "deadline",
        breaker.into_dyn(),
        Duration::from_secs(2),
        clock.clone(),
    )
    .into_dyn();

    // Race the guarded upstream against a slower static mirror.
    let mirror = Transform::new("mirror", |ctx: Context, url: String| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => format!("{url} -> 200 OK (mirror)"),
            _ = ctx.cancelled() => url,
        }
    })
    .into_dyn();

    let race = Race::new("fetch", vec![guarded, mirror]);
    race.on_winner()
        .subscribe(|event| println!("winner: {}", event.winner));

    let out = race
        .process(&Context::background(), "https://example.com/feed".to_string())
        .await?;
    println!("fetched: {out}");

    race.close().await?;
    Ok(())
}
