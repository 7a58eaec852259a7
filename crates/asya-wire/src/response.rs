// SPDX-License-Identifier: MIT OR Apache-2.0
//! Response shapes: a JSON array of result envelopes, `null`, or a single
//! error object.

use asya_model::{Envelope, ErrorCode, ErrorSeverity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// ErrorResponse
// ---------------------------------------------------------------------------

/// The structured error object the runtime returns in place of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always the literal `"error"`.
    #[serde(default = "error_status")]
    pub status: String,
    /// Wire error code.
    #[serde(rename = "error")]
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Exception class name from the handler, when one exists.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Recoverability hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ErrorSeverity>,
    /// Suggested delay before retrying, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

fn error_status() -> String {
    "error".to_string()
}

impl ErrorResponse {
    /// Build an error response for `code`, filling severity and retry hints
    /// from the code's defaults.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: error_status(),
            code,
            message: message.into(),
            class: None,
            severity: Some(code.severity()),
            retry_after: code.suggested_retry_after(),
        }
    }

    /// Attach the handler's exception class name.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WireResponse
// ---------------------------------------------------------------------------

/// Tagged interpretation of the runtime's reply, distinguished on JSON type.
///
/// * array of length `k ≥ 1` — fan-out of `k` downstream envelopes;
/// * empty array or `null` — success with no continuation;
/// * object with an `error` field — structured failure.
#[derive(Debug, Clone, PartialEq)]
pub enum WireResponse {
    /// One or more result envelopes, each already carrying its final
    /// `route.current`.
    Results(Vec<Envelope>),
    /// Success with no continuation; the sidecar routes the original
    /// envelope to the success sink.
    NoContinuation,
    /// The handler (or supervisor) failed.
    Error(ErrorResponse),
}

impl WireResponse {
    /// Parse a decoded JSON value into a response.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Null => Ok(Self::NoContinuation),
            Value::Array(items) => {
                if items.is_empty() {
                    return Ok(Self::NoContinuation);
                }
                let envelopes = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Envelope>, _>>()
                    .map_err(ProtocolError::Json)?;
                Ok(Self::Results(envelopes))
            }
            Value::Object(map) => {
                if !map.contains_key("error") {
                    return Err(ProtocolError::UnexpectedShape(
                        "object without an 'error' field".into(),
                    ));
                }
                let err = serde_json::from_value(Value::Object(map)).map_err(ProtocolError::Json)?;
                Ok(Self::Error(err))
            }
            other => Err(ProtocolError::UnexpectedShape(format!(
                "expected array, null, or error object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Parse raw frame bytes into a response.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes).map_err(ProtocolError::Json)?;
        Self::from_value(value)
    }

    /// Serialize to the wire JSON value.
    ///
    /// `NoContinuation` serializes as an empty array, which is what the
    /// supervisor emits; `null` is accepted on decode for compatibility.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::Results(envelopes) => {
                serde_json::to_value(envelopes).map_err(ProtocolError::Json)
            }
            Self::NoContinuation => Ok(Value::Array(Vec::new())),
            Self::Error(err) => serde_json::to_value(err).map_err(ProtocolError::Json),
        }
    }

    /// Serialize to raw frame bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self.to_value()?).map_err(ProtocolError::Json)
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asya_model::Route;
    use serde_json::json;

    #[test]
    fn null_is_no_continuation() {
        assert_eq!(
            WireResponse::from_value(json!(null)).unwrap(),
            WireResponse::NoContinuation
        );
    }

    #[test]
    fn empty_array_is_no_continuation() {
        assert_eq!(
            WireResponse::from_value(json!([])).unwrap(),
            WireResponse::NoContinuation
        );
    }

    #[test]
    fn array_parses_envelopes() {
        let v = json!([{
            "id": "1",
            "route": {"actors": ["a", "b"], "current": 1},
            "headers": {},
            "payload": {"t": "x"}
        }]);
        match WireResponse::from_value(v).unwrap() {
            WireResponse::Results(envs) => {
                assert_eq!(envs.len(), 1);
                assert_eq!(envs[0].route.current, 1);
            }
            other => panic!("expected results, got {other:?}"),
        }
    }

    #[test]
    fn error_object_parses() {
        let v = json!({
            "status": "error",
            "error": "oom_error",
            "message": "out of memory",
            "type": "MemoryError",
            "severity": "recoverable",
            "retry_after": 30
        });
        match WireResponse::from_value(v).unwrap() {
            WireResponse::Error(e) => {
                assert_eq!(e.code, ErrorCode::OomError);
                assert_eq!(e.class.as_deref(), Some("MemoryError"));
                assert_eq!(e.severity, Some(ErrorSeverity::Recoverable));
                assert_eq!(e.retry_after, Some(30));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn minimal_error_object_parses() {
        let v = json!({"error": "processing_error", "message": "boom"});
        match WireResponse::from_value(v).unwrap() {
            WireResponse::Error(e) => {
                assert_eq!(e.code, ErrorCode::ProcessingError);
                assert_eq!(e.status, "error");
                assert!(e.class.is_none());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn scalar_response_rejected() {
        assert!(matches!(
            WireResponse::from_value(json!(42)),
            Err(ProtocolError::UnexpectedShape(_))
        ));
        assert!(matches!(
            WireResponse::from_value(json!("ok")),
            Err(ProtocolError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn object_without_error_field_rejected() {
        // A bare envelope is not a legal response; results always arrive in
        // an array.
        assert!(WireResponse::from_value(json!({"id": "1"})).is_err());
    }

    #[test]
    fn no_continuation_serializes_as_empty_array() {
        assert_eq!(
            WireResponse::NoContinuation.to_value().unwrap(),
            json!([])
        );
    }

    #[test]
    fn results_round_trip() {
        let env = Envelope::new("1", Route::new(["a"]), json!({"x": 1}));
        let resp = WireResponse::Results(vec![env]);
        let bytes = resp.to_vec().unwrap();
        assert_eq!(WireResponse::from_slice(&bytes).unwrap(), resp);
    }

    #[test]
    fn from_code_fills_defaults() {
        let e = ErrorResponse::from_code(ErrorCode::CudaOomError, "gpu oom");
        assert_eq!(e.severity, Some(ErrorSeverity::Recoverable));
        assert_eq!(e.retry_after, Some(60));
        let e = ErrorResponse::from_code(ErrorCode::ProcessingError, "boom");
        assert_eq!(e.severity, Some(ErrorSeverity::Fatal));
        assert_eq!(e.retry_after, None);
    }
}
