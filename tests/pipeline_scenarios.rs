// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios: real supervisors on Unix sockets, the
//! in-memory transport, and one router per actor.

mod common;

use std::time::Duration;

use asya_config::HandlerMode;
use asya_model::{Envelope, ErrorCode, Route};
use asya_runtime::{
    EnvelopeResult, FnHandler, Handler, HandlerError, HandlerRegistry, HandlerResult,
};
use asya_sidecar::Outcome;
use async_trait::async_trait;
use common::Harness;
use serde_json::{json, Value};

fn envelope(id: &str, actors: &[&str], payload: Value) -> Envelope {
    Envelope::new(id, Route::new(actors.iter().copied()), payload)
}

#[tokio::test]
async fn single_step_success() {
    let harness = Harness::new();
    let mut registry = HandlerRegistry::new();
    registry.register("handlers.echo", FnHandler(|p| Ok(HandlerResult::One(p))));
    let router = harness
        .actor("echo", registry, "handlers.echo", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let input = envelope("1", &["echo"], json!({"x": 42}));
    harness.admit(&input).await;
    let outcome = harness.step(&router, "echo").await;

    assert_eq!(outcome, Outcome::Forwarded(1));
    let sunk = harness.envelopes_on("asya-success-sink");
    assert_eq!(sunk.len(), 1);
    assert_eq!(sunk[0].id, "1");
    assert_eq!(sunk[0].route.actors, vec!["echo"]);
    assert_eq!(sunk[0].route.current, 1);
    assert_eq!(sunk[0].payload, json!({"x": 42}));
    // Original acked: its queue is empty.
    assert!(harness.transport.is_empty("asya-echo"));
}

#[tokio::test]
async fn three_step_pipeline() {
    let harness = Harness::new();

    let mut prep_reg = HandlerRegistry::new();
    prep_reg.register(
        "handlers.prep",
        FnHandler(|_| Ok(HandlerResult::One(json!({"tokens": [1, 2]})))),
    );
    let prep = harness
        .actor("prep", prep_reg, "handlers.prep", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let mut infer_reg = HandlerRegistry::new();
    infer_reg.register(
        "handlers.infer",
        FnHandler(|_| Ok(HandlerResult::One(json!({"prediction": "greeting"})))),
    );
    let infer = harness
        .actor("infer", infer_reg, "handlers.infer", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let mut post_reg = HandlerRegistry::new();
    post_reg.register(
        "handlers.post",
        FnHandler(|_| Ok(HandlerResult::One(json!({"output": "GREETING"})))),
    );
    let post = harness
        .actor("post", post_reg, "handlers.post", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let input = envelope("2", &["prep", "infer", "post"], json!({"text": "hi"}));
    harness.admit(&input).await;

    assert_eq!(harness.step(&prep, "prep").await, Outcome::Forwarded(1));
    assert_eq!(harness.step(&infer, "infer").await, Outcome::Forwarded(1));
    assert_eq!(harness.step(&post, "post").await, Outcome::Forwarded(1));

    let sunk = harness.envelopes_on("asya-success-sink");
    assert_eq!(sunk.len(), 1);
    assert_eq!(sunk[0].route.current, 3);
    assert_eq!(sunk[0].payload, json!({"output": "GREETING"}));
    for queue in ["asya-prep", "asya-infer", "asya-post", "asya-error-sink"] {
        assert!(harness.transport.is_empty(queue), "{queue} should be empty");
    }
}

#[tokio::test]
async fn fan_out_two_branches() {
    let harness = Harness::new();
    let mut registry = HandlerRegistry::new();
    registry.register(
        "handlers.split",
        FnHandler(|_| Ok(HandlerResult::Many(vec![json!({"t": "a"}), json!({"t": "b"})]))),
    );
    let router = harness
        .actor("split", registry, "handlers.split", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let input = envelope("3", &["split", "process"], json!({"text": "a b"}));
    harness.admit(&input).await;
    let outcome = harness.step(&router, "split").await;

    assert_eq!(outcome, Outcome::Forwarded(2));
    let branches = harness.envelopes_on("asya-process");
    assert_eq!(branches.len(), 2);
    let payloads: Vec<&Value> = branches.iter().map(|e| &e.payload).collect();
    assert!(payloads.contains(&&json!({"t": "a"})));
    assert!(payloads.contains(&&json!({"t": "b"})));
    for branch in &branches {
        assert_eq!(branch.id, "3");
        assert_eq!(branch.route.current, 1);
    }
    assert!(harness.transport.is_empty("asya-split"));
}

#[tokio::test]
async fn handler_error_reaches_error_sink() {
    let harness = Harness::new();
    let mut registry = HandlerRegistry::new();
    registry.register(
        "handlers.explode",
        FnHandler(|_| -> Result<HandlerResult, HandlerError> {
            Err(HandlerError::failure("ValueError", "bad"))
        }),
    );
    let router = harness
        .actor("err", registry, "handlers.explode", HandlerMode::Payload, Duration::from_secs(5))
        .await;

    let input = envelope("4", &["err"], json!({"q": 1}));
    harness.admit(&input).await;
    let outcome = harness.step(&router, "err").await;

    assert_eq!(outcome, Outcome::ErrorSink(ErrorCode::ProcessingError));
    let sunk = harness.envelopes_on("asya-error-sink");
    assert_eq!(sunk.len(), 1);
    let error = sunk[0].error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::ProcessingError);
    assert!(error.message.contains("bad"));
    assert_eq!(error.class.as_deref(), Some("ValueError"));
    // Original envelope content rides along for the error-sink actor.
    assert_eq!(sunk[0].id, "4");
    assert_eq!(sunk[0].payload, json!({"q": 1}));
    assert!(harness.transport.is_empty("asya-err"));
    assert!(harness.transport.is_empty("asya-success-sink"));
}

struct SleepyHandler;

#[async_trait]
impl Handler for SleepyHandler {
    async fn call(&self, _payload: Value) -> Result<HandlerResult, HandlerError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(HandlerResult::None)
    }
}

#[tokio::test]
async fn timeout_synthesizes_timeout_error() {
    let harness = Harness::new();
    let mut registry = HandlerRegistry::new();
    registry.register("handlers.sleepy", SleepyHandler);
    let router = harness
        .actor("slow", registry, "handlers.sleepy", HandlerMode::Payload, Duration::from_secs(1))
        .await;

    let input = envelope("5", &["slow", "after"], json!(null));
    harness.admit(&input).await;
    let start = std::time::Instant::now();
    let outcome = harness.step(&router, "slow").await;

    assert_eq!(outcome, Outcome::ErrorSink(ErrorCode::TimeoutError));
    assert!(start.elapsed() < Duration::from_secs(2), "deadline must be tight");
    let sunk = harness.envelopes_on("asya-error-sink");
    assert_eq!(sunk.len(), 1);
    assert_eq!(sunk[0].error.as_ref().unwrap().code, ErrorCode::TimeoutError);
    assert!(harness.transport.is_empty("asya-after"));
    assert!(harness.transport.is_empty("asya-slow"));
}

struct PrefixMutator;

#[async_trait]
impl Handler for PrefixMutator {
    async fn call(&self, _payload: Value) -> Result<HandlerResult, HandlerError> {
        unreachable!("envelope mode only")
    }

    async fn call_envelope(&self, mut env: Envelope) -> Result<EnvelopeResult, HandlerError> {
        env.route.actors[0] = "rewritten".to_string();
        env.route.advance();
        Ok(EnvelopeResult::One(env))
    }
}

#[tokio::test]
async fn envelope_mode_prefix_mutation_is_fatal() {
    let harness = Harness::new();
    let mut registry = HandlerRegistry::new();
    registry.register("handlers.mutate", PrefixMutator);
    let router = harness
        .actor("second", registry, "handlers.mutate", HandlerMode::Envelope, Duration::from_secs(5))
        .await;

    let mut input = envelope("6", &["first", "second", "third"], json!(null));
    input.route.current = 1;
    harness.admit(&input).await;
    let outcome = harness.step(&router, "second").await;

    assert_eq!(outcome, Outcome::ErrorSink(ErrorCode::ProcessingError));
    let sunk = harness.envelopes_on("asya-error-sink");
    assert_eq!(sunk.len(), 1);
    assert!(sunk[0]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("processed prefix"));
    assert!(harness.transport.is_empty("asya-third"));
    assert!(harness.transport.is_empty("asya-success-sink"));
}
