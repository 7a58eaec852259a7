// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-model
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Transport-agnostic message model. Everything in this crate is plain data:
//! the sidecar, the runtime supervisor, and the control plane all speak in
//! terms of these types, but none of the I/O lives here.

pub mod envelope;
pub mod error;
pub mod route;

pub use envelope::{Envelope, EnvelopeError, Headers};
pub use error::{ErrorCode, ErrorSeverity, ModelError};
pub use route::{Destination, Route};

/// Reserved actor name whose queue terminates successful pipelines.
pub const SUCCESS_SINK: &str = "success-sink";

/// Reserved actor name whose queue terminates failed pipelines.
pub const ERROR_SINK: &str = "error-sink";

/// Returns `true` if `name` is one of the reserved sink actor names.
///
/// Reserved names are destinations computed by the sidecar; they must never
/// appear inside `route.actors`.
pub fn is_reserved_actor(name: &str) -> bool {
    name == SUCCESS_SINK || name == ERROR_SINK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved_actor("success-sink"));
        assert!(is_reserved_actor("error-sink"));
        assert!(!is_reserved_actor("echo"));
        assert!(!is_reserved_actor("success_sink"));
    }
}
