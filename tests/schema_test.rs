use pipeflow::connector::{CircuitBreaker, Fallback, Race, Retry, Sequence, Timeout};
use pipeflow::processor::Transform;
use pipeflow::testing::FakeClock;
use pipeflow::{Chainable, Context, DynChainable, Node};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn step(name: &'static str) -> DynChainable<String> {
    Transform::new(name, |_ctx, s: String| async move { s }).into_dyn()
}

fn build_pipeline() -> Sequence<String> {
    let clock = Arc::new(FakeClock::new());

    let guarded = CircuitBreaker::new(
        "breaker",
        Retry::new("retry", step("fetch"), 3).into_dyn(),
        5,
        Duration::from_secs(30),
        clock.clone(),
    )
    .into_dyn();

    let bounded = Timeout::new("deadline", guarded, Duration::from_secs(2), clock).into_dyn();

    let race = Race::new("mirrors", vec![step("mirror-a"), step("mirror-b")]).into_dyn();
    let fallback = Fallback::new("source", race, vec![step("cache")]).into_dyn();

    Sequence::with_steps("ingest", vec![bounded, fallback, step("store")])
}

/// The schema mirrors the connector tree: types, flows, and child order.
#[tokio::test]
async fn test_schema_mirrors_tree() {
    let pipeline = build_pipeline();
    let schema = pipeline.schema();
    let value: Value = serde_json::from_str(&schema.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], "sequence");
    assert_eq!(value["name"], "ingest");

    let steps = value["flow"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);

    assert_eq!(steps[0]["type"], "timeout");
    assert_eq!(steps[0]["metadata"]["duration_ms"], 2000);
    let breaker = &steps[0]["flow"]["processor"];
    assert_eq!(breaker["type"], "circuit_breaker");
    assert_eq!(breaker["metadata"]["failure_threshold"], 5);
    assert_eq!(breaker["flow"]["processor"]["type"], "retry");

    assert_eq!(steps[1]["type"], "fallback");
    assert_eq!(steps[1]["flow"]["primary"]["type"], "race");
    let competitors = steps[1]["flow"]["primary"]["flow"]["competitors"]
        .as_array()
        .unwrap();
    assert_eq!(competitors[0]["name"], "mirror-a");
    assert_eq!(competitors[1]["name"], "mirror-b");

    assert_eq!(steps[2]["type"], "transform");
    assert_eq!(steps[2]["name"], "store");
}

/// Every node in the tree carries a distinct UUID.
#[tokio::test]
async fn test_schema_ids_are_unique() {
    fn collect_ids(node: &Value, ids: &mut HashSet<String>) {
        if let Some(id) = node.get("id").and_then(Value::as_str) {
            assert!(ids.insert(id.to_string()), "duplicate id {id}");
        }
        match node.get("flow") {
            Some(flow) => {
                for key in ["steps", "backups", "competitors", "tasks"] {
                    if let Some(children) = flow.get(key).and_then(Value::as_array) {
                        for child in children {
                            collect_ids(child, ids);
                        }
                    }
                }
                for key in ["primary", "processor", "error_handler", "root"] {
                    if let Some(child) = flow.get(key) {
                        if child.is_object() {
                            collect_ids(child, ids);
                        }
                    }
                }
                if let Some(routes) = flow.get("routes").and_then(Value::as_object) {
                    for child in routes.values() {
                        collect_ids(child, ids);
                    }
                }
            }
            None => {}
        }
    }

    let schema = build_pipeline().schema();
    let value: Value = serde_json::from_str(&schema.to_json().unwrap()).unwrap();
    let mut ids = HashSet::new();
    collect_ids(&value, &mut ids);
    assert!(ids.len() >= 9);
}

/// Deserialized schemas are display-only: names survive, UUIDs do not.
#[tokio::test]
async fn test_schema_round_trip_regenerates_ids() {
    let schema = build_pipeline().schema();
    let original_id = schema.id;

    let round_tripped = Node::from_json(&schema.to_json().unwrap()).unwrap();
    assert_eq!(round_tripped.name, "ingest");
    assert_eq!(round_tripped.node_type, "sequence");
    assert_ne!(round_tripped.id, original_id);
}

/// The schema reflects runtime mutation.
#[tokio::test]
async fn test_schema_tracks_mutation() {
    let pipeline = Sequence::with_steps("p", vec![step("a")]);
    assert_eq!(
        pipeline.schema().to_json().unwrap().matches("\"name\"").count(),
        2
    );

    pipeline.push_back(step("b"));
    let value: Value =
        serde_json::from_str(&pipeline.schema().to_json().unwrap()).unwrap();
    let steps = value["flow"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1]["name"], "b");
}

/// Processing still works on the same tree the schema was rendered from.
#[tokio::test]
async fn test_schema_and_process_share_tree() {
    let pipeline = build_pipeline();
    let _ = pipeline.schema();
    let out = pipeline
        .process(&Context::background(), "payload".to_string())
        .await
        .unwrap();
    assert_eq!(out, "payload");
}
