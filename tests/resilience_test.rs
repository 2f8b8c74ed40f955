use pipeflow::connector::{Backoff, BreakerState, CircuitBreaker, LimiterMode, RateLimiter, Retry};
use pipeflow::core::ErrorCause;
use pipeflow::testing::{FakeClock, TrackingProcessor};
use pipeflow::{Chainable, Clock, Context, DynChainable};
use std::sync::Arc;
use std::time::Duration;

/// Retry counts: a child that errors until attempt K is invoked exactly K
/// times when K <= maxAttempts.
#[tokio::test]
async fn test_retry_invocation_count() {
    for (fail_first, max_attempts, expected_calls) in [(0u32, 3u32, 1u32), (2, 3, 3), (2, 5, 3)] {
        let child = Arc::new(TrackingProcessor::<i64>::new("flaky").fail_first(fail_first));
        let retry = Retry::new("retry", child.clone() as DynChainable<i64>, max_attempts);

        let result = retry.process(&Context::background(), 1).await;
        assert!(result.is_ok());
        assert_eq!(child.calls(), expected_calls);
    }
}

/// Exhaustion carries the last underlying error.
#[tokio::test]
async fn test_retry_exhaustion() {
    let child = Arc::new(TrackingProcessor::<i64>::new("flaky").fail_first_with(99, "still down"));
    let retry = Retry::new("retry", child.clone() as DynChainable<i64>, 4);

    let err = retry.process(&Context::background(), 1).await.unwrap_err();
    assert_eq!(child.calls(), 4);
    assert_eq!(err.path, vec!["retry", "flaky"]);
    assert!(err.to_string().contains("still down"));
}

/// Backoff recovery: fails twice with "temp", succeeds on attempt 3
/// doubling the input, after exactly two delays (50ms then 100ms).
#[tokio::test]
async fn test_backoff_recovery() {
    let clock = Arc::new(FakeClock::auto());
    let start = clock.now();

    let child = Arc::new(
        TrackingProcessor::<i64>::new("flaky")
            .fail_first_with(2, "temp")
            .with_transform(|n| n * 2),
    );
    let backoff = Backoff::new(
        "backoff",
        child.clone() as DynChainable<i64>,
        3,
        Duration::from_millis(50),
        clock.clone(),
    );

    let out = backoff.process(&Context::background(), 5).await.unwrap();
    assert_eq!(out, 10);
    assert_eq!(child.calls(), 3);
    assert_eq!(clock.since(start), Duration::from_millis(150));
}

/// Backoff timing law: with persistent failure the total virtual delay is
/// base * (2^(N-1) - 1).
#[tokio::test]
async fn test_backoff_timing_law() {
    let base = Duration::from_millis(50);
    for attempts in [1u32, 2, 3, 4, 5] {
        let clock = Arc::new(FakeClock::auto());
        let start = clock.now();

        let child = Arc::new(TrackingProcessor::<i64>::new("down").fail_first(u32::MAX));
        let backoff = Backoff::new(
            "backoff",
            child as DynChainable<i64>,
            attempts,
            base,
            clock.clone(),
        );

        backoff.process(&Context::background(), 1).await.unwrap_err();
        let expected = base * (2u32.pow(attempts - 1) - 1);
        assert_eq!(clock.since(start), expected, "attempts = {attempts}");
    }
}

/// Backoff failure reports the original input, not a partial value.
#[tokio::test]
async fn test_backoff_failure_keeps_original_input() {
    let clock = Arc::new(FakeClock::auto());
    let child = Arc::new(TrackingProcessor::<i64>::new("down").fail_first(u32::MAX));
    let backoff = Backoff::new(
        "backoff",
        child as DynChainable<i64>,
        3,
        Duration::from_millis(10),
        clock,
    );

    let err = backoff.process(&Context::background(), 42).await.unwrap_err();
    assert_eq!(err.input_data, Some(42));
}

/// A canceled context aborts the backoff wait with a context error and no
/// further attempts.
#[tokio::test]
async fn test_backoff_cancellation_during_wait() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(TrackingProcessor::<i64>::new("down").fail_first(u32::MAX));
    let backoff = Arc::new(Backoff::new(
        "backoff",
        child.clone() as DynChainable<i64>,
        5,
        Duration::from_secs(1),
        clock.clone(),
    ));

    let ctx = Context::background();
    let runner = backoff.clone();
    let runner_ctx = ctx.clone();
    let handle = tokio::spawn(async move { runner.process(&runner_ctx, 1).await });

    // First attempt fails immediately, then the connector parks in its wait.
    clock.wait_for_sleepers(1).await;
    ctx.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(child.calls(), 1);
}

/// Circuit opens after exactly failureThreshold consecutive failures and
/// rejects without invoking the child.
#[tokio::test]
async fn test_circuit_opens_and_rejects() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(
        TrackingProcessor::<i32>::new("service").fail_first_with(u32::MAX, "service error"),
    );
    let breaker = CircuitBreaker::new(
        "breaker",
        child.clone() as DynChainable<i32>,
        3,
        Duration::from_secs(5),
        clock,
    );

    let ctx = Context::background();
    for _ in 0..3 {
        let err = breaker.process(&ctx, 1).await.unwrap_err();
        assert!(err.to_string().contains("service error"));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    // Fourth call, clock not advanced: rejected, child untouched.
    let err = breaker.process(&ctx, 1).await.unwrap_err();
    assert_eq!(child.calls(), 3);
    match &err.cause {
        ErrorCause::Rejected(msg) => assert_eq!(msg, "circuit breaker is open"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

/// From HalfOpen, exactly successThreshold consecutive successes close the
/// breaker; any failure before that reopens it.
#[tokio::test]
async fn test_circuit_close_cycle() {
    let clock = Arc::new(FakeClock::new());
    let failing = Arc::new(TrackingProcessor::<i32>::new("service").fail_first(u32::MAX));
    let breaker = CircuitBreaker::new(
        "breaker",
        failing as DynChainable<i32>,
        1,
        Duration::from_secs(5),
        clock.clone(),
    );
    breaker.set_success_threshold(3);

    let ctx = Context::background();
    let _ = breaker.process(&ctx, 1).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    // Probe window opens after the reset timeout.
    clock.advance(Duration::from_secs(6));
    let healthy = Arc::new(TrackingProcessor::<i32>::new("service"));
    breaker.set_child(healthy as DynChainable<i32>);

    for expected in [BreakerState::HalfOpen, BreakerState::HalfOpen, BreakerState::Closed] {
        breaker.process(&ctx, 1).await.unwrap();
        assert_eq!(breaker.state(), expected);
    }
}

#[tokio::test]
async fn test_circuit_half_open_failure_reopens() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(TrackingProcessor::<i32>::new("service").fail_first(u32::MAX));
    let breaker = CircuitBreaker::new(
        "breaker",
        child as DynChainable<i32>,
        1,
        Duration::from_secs(5),
        clock.clone(),
    );
    breaker.set_success_threshold(2);

    let ctx = Context::background();
    let _ = breaker.process(&ctx, 1).await;
    clock.advance(Duration::from_secs(6));

    let _ = breaker.process(&ctx, 1).await;
    assert_eq!(breaker.state(), BreakerState::Open);
}

/// Reset forces Closed and invalidates in-flight generations.
#[tokio::test]
async fn test_circuit_reset() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(TrackingProcessor::<i32>::new("service").fail_first(u32::MAX));
    let breaker = CircuitBreaker::new(
        "breaker",
        child as DynChainable<i32>,
        1,
        Duration::from_secs(5),
        clock,
    );

    let ctx = Context::background();
    let _ = breaker.process(&ctx, 1).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    let before = breaker.generation();
    breaker.reset();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.generation() > before);
}

/// Drop mode: with burst B, an instantaneous arrival of B+1 calls drops
/// exactly one.
#[tokio::test]
async fn test_rate_limiter_drop_mode() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(TrackingProcessor::<i32>::new("work"));
    let limiter = RateLimiter::new(
        "limiter",
        child.clone() as DynChainable<i32>,
        10.0,
        3,
        clock,
    )
    .unwrap();
    limiter.set_mode(LimiterMode::Drop);

    let ctx = Context::background();
    let mut dropped = 0;
    for i in 0..4 {
        match limiter.process(&ctx, i).await {
            Ok(_) => {}
            Err(err) => {
                dropped += 1;
                match &err.cause {
                    ErrorCause::Rejected(msg) => assert_eq!(msg, "rate limit exceeded"),
                    other => panic!("expected rejection, got {other:?}"),
                }
            }
        }
    }
    assert_eq!(dropped, 1);
    assert_eq!(child.calls(), 3);
}

/// Wait mode: the blocked call proceeds once refill accrues a token.
#[tokio::test]
async fn test_rate_limiter_wait_mode() {
    let clock = Arc::new(FakeClock::new());
    let child = Arc::new(TrackingProcessor::<i32>::new("work"));
    let limiter = Arc::new(
        RateLimiter::new(
            "limiter",
            child.clone() as DynChainable<i32>,
            2.0,
            1,
            clock.clone(),
        )
        .unwrap(),
    );

    let ctx = Context::background();
    limiter.process(&ctx, 1).await.unwrap();

    let waiter = limiter.clone();
    let waiter_ctx = ctx.clone();
    let handle = tokio::spawn(async move { waiter.process(&waiter_ctx, 2).await });

    clock.wait_for_sleepers(1).await;
    // At 2 tokens/s, half a second accrues the needed token.
    clock.advance(Duration::from_millis(500));

    handle.await.unwrap().unwrap();
    assert_eq!(child.calls(), 2);
}
