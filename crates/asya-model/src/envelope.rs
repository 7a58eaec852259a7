// SPDX-License-Identifier: MIT OR Apache-2.0
//! The envelope: one unit of work on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, ModelError};
use crate::route::Route;

/// Cross-cutting metadata attached to an envelope.
///
/// Sidecars preserve headers unchanged; only envelope-mode handlers may
/// mutate them.
pub type Headers = Map<String, Value>;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A transport-agnostic record carrying one unit of work through a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque identifier, unique per admission. Shared across fan-out
    /// branches.
    pub id: String,
    /// Routing state.
    pub route: Route,
    /// Cross-cutting metadata (trace ids, priorities, deadlines).
    #[serde(default)]
    pub headers: Headers,
    /// The user data actors transform.
    #[serde(default)]
    pub payload: Value,
    /// Present only on envelopes bound for the error sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

/// Error block attached to envelopes routed to the error sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Wire error code.
    #[serde(rename = "type")]
    pub code: ErrorCode,
    /// Human-readable description of the failure.
    pub message: String,
    /// Exception class name reported by the handler, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Name of the actor where the failure occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl Envelope {
    /// Build a fresh envelope at the head of `route`.
    pub fn new(id: impl Into<String>, route: Route, payload: Value) -> Self {
        Self {
            id: id.into(),
            route,
            headers: Headers::new(),
            payload,
            error: None,
        }
    }

    /// Structural validation at a serialization boundary (queue put / get).
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.id.is_empty() {
            return Err(ModelError::EmptyId);
        }
        self.route.validate()
    }

    /// Validation for envelopes received on an actor queue: the route must
    /// still be dispatchable.
    pub fn validate_active(&self) -> Result<(), ModelError> {
        if self.id.is_empty() {
            return Err(ModelError::EmptyId);
        }
        self.route.validate_active()
    }

    /// Expand a payload-mode fan-out: one result envelope per payload, each
    /// carrying this envelope's id and headers unchanged with the cursor
    /// advanced one hop. Branches share the semantic id; fan-out never
    /// introduces fan-in.
    pub fn fan_out(&self, payloads: Vec<Value>) -> Vec<Envelope> {
        let advanced = self.route.advanced();
        payloads
            .into_iter()
            .map(|payload| Envelope {
                id: self.id.clone(),
                route: advanced.clone(),
                headers: self.headers.clone(),
                payload,
                error: None,
            })
            .collect()
    }

    /// Build the error envelope for this unit of work: original id, route
    /// (unadvanced), headers, and payload, plus the error block.
    pub fn to_error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        class: Option<String>,
        actor: Option<String>,
    ) -> Envelope {
        Envelope {
            id: self.id.clone(),
            route: self.route.clone(),
            headers: self.headers.clone(),
            payload: self.payload.clone(),
            error: Some(EnvelopeError {
                code,
                message: message.into(),
                class,
                actor,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut env = Envelope::new(
            "e-1",
            Route::new(["prep", "infer", "post"]),
            json!({"text": "hi"}),
        );
        env.headers
            .insert("trace-id".into(), Value::from("t-123"));
        env
    }

    // --- serde shape ---

    #[test]
    fn wire_shape_round_trip() {
        let raw = json!({
            "id": "1",
            "route": {"actors": ["echo"], "current": 0},
            "payload": {"x": 42},
            "headers": {}
        });
        let env: Envelope = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(env.id, "1");
        assert_eq!(env.route.current_actor(), Some("echo"));
        assert_eq!(env.payload, json!({"x": 42}));
        assert!(env.error.is_none());
        // The error field is absent, not null, on ordinary envelopes.
        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn missing_headers_default_to_empty() {
        let raw = json!({
            "id": "1",
            "route": {"actors": ["echo"], "current": 0},
            "payload": null
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert!(env.headers.is_empty());
    }

    #[test]
    fn error_block_serializes_with_type_key() {
        let env = sample().to_error(
            ErrorCode::ProcessingError,
            "bad",
            Some("ValueError".into()),
            Some("prep".into()),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["error"]["type"], "processing_error");
        assert_eq!(v["error"]["message"], "bad");
        assert_eq!(v["error"]["class"], "ValueError");
        assert_eq!(v["error"]["actor"], "prep");
    }

    // --- validation ---

    #[test]
    fn empty_id_rejected() {
        let mut env = sample();
        env.id.clear();
        assert_eq!(env.validate(), Err(ModelError::EmptyId));
    }

    // --- fan-out ---

    #[test]
    fn fan_out_advances_and_shares_identity() {
        let input = sample();
        let results = input.fan_out(vec![json!({"t": "a"}), json!({"t": "b"})]);
        assert_eq!(results.len(), 2);
        for out in &results {
            assert_eq!(out.id, "e-1");
            assert_eq!(out.route.current, 1);
            assert_eq!(out.route.actors, input.route.actors);
            // Headers are identical across branches.
            assert_eq!(out.headers, input.headers);
        }
        assert_eq!(results[0].payload, json!({"t": "a"}));
        assert_eq!(results[1].payload, json!({"t": "b"}));
    }

    #[test]
    fn single_result_advances_once() {
        let out = sample().fan_out(vec![json!(1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].route.current, 1);
    }

    #[test]
    fn fan_out_of_nothing_is_empty() {
        assert!(sample().fan_out(vec![]).is_empty());
    }

    // --- error envelope ---

    #[test]
    fn error_envelope_keeps_original_route_and_payload() {
        let input = sample();
        let err = input.to_error(ErrorCode::TimeoutError, "deadline", None, Some("prep".into()));
        assert_eq!(err.route, input.route); // unadvanced
        assert_eq!(err.payload, input.payload);
        assert_eq!(err.headers, input.headers);
        assert_eq!(err.error.as_ref().unwrap().code, ErrorCode::TimeoutError);
    }
}
