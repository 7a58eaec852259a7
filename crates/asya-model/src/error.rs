// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable wire error codes and model-level validation errors.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable error code carried on error envelopes and in runtime
/// error responses.
///
/// This is a closed set: every failure the framework can surface maps to
/// exactly one of these codes, and the serialized form is guaranteed not to
/// change across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The sidecar-side processing deadline elapsed before the runtime
    /// produced a complete response.
    TimeoutError,
    /// The handler exhausted host memory. Recoverable; retry after a pause.
    OomError,
    /// The handler exhausted GPU memory. Recoverable; retry after a pause.
    CudaOomError,
    /// The handler failed with an ordinary error. Usually fatal.
    ProcessingError,
    /// The envelope (or a framed message) was not valid JSON, or violated a
    /// route invariant.
    InvalidJson,
    /// Dialing, writing to, or reading from the runtime socket failed.
    ConnectionError,
}

/// Whether an error is worth redelivering for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// The same envelope may succeed on a later attempt.
    Recoverable,
    /// Retrying the same envelope is unlikely to help.
    Fatal,
}

impl ErrorCode {
    /// Default severity classification for this code.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::OomError | Self::CudaOomError => ErrorSeverity::Recoverable,
            Self::TimeoutError
            | Self::ProcessingError
            | Self::InvalidJson
            | Self::ConnectionError => ErrorSeverity::Fatal,
        }
    }

    /// Suggested retry delay in seconds, for codes where waiting is known to
    /// help (memory pressure subsiding, allocator caches draining).
    pub fn suggested_retry_after(&self) -> Option<u64> {
        match self {
            Self::OomError => Some(30),
            Self::CudaOomError => Some(60),
            _ => None,
        }
    }

    /// The stable serialized form of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeoutError => "timeout_error",
            Self::OomError => "oom_error",
            Self::CudaOomError => "cuda_oom_error",
            Self::ProcessingError => "processing_error",
            Self::InvalidJson => "invalid_json",
            Self::ConnectionError => "connection_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Validation failures raised by the envelope / route model.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    /// `route.actors` was empty.
    #[error("route has no actors")]
    EmptyRoute,

    /// `route.current` points past the last legal position.
    #[error("route cursor {current} out of bounds for {len} actors")]
    CursorOutOfBounds {
        /// The offending cursor value.
        current: usize,
        /// Number of actors in the route.
        len: usize,
    },

    /// The route is exhausted where an active (dispatchable) route was
    /// required.
    #[error("route is exhausted (cursor {current} == {len} actors)")]
    RouteExhausted {
        /// The cursor value.
        current: usize,
        /// Number of actors in the route.
        len: usize,
    },

    /// A reserved sink name appeared inside `route.actors`.
    #[error("reserved actor name '{name}' in route")]
    ReservedActor {
        /// The reserved name that was found.
        name: String,
    },

    /// The processed prefix of the route was altered by a handler.
    #[error("processed prefix altered at position {position}")]
    PrefixAltered {
        /// First position where input and output routes disagree.
        position: usize,
    },

    /// The envelope id was empty.
    #[error("envelope id is empty")]
    EmptyId,
}
