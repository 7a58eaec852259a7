// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod builtins;
pub mod handler;
pub mod oom;
pub mod supervisor;

pub use handler::{
    EnvelopeResult, FnHandler, Handler, HandlerError, HandlerRegistry, HandlerResult,
};
pub use oom::{classify, CleanupHooks};
pub use supervisor::Supervisor;

use thiserror::Error;

/// Unrecoverable supervisor failures. These end the process; the container
/// orchestrator owns the restart loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configured handler locator is not in the registry.
    #[error("handler '{0}' is not registered")]
    UnknownHandler(String),

    /// The locator string is not of the form `module.function` or
    /// `module.Class.method`.
    #[error("invalid handler locator '{0}'")]
    InvalidLocator(String),

    /// Creating, permissioning, or listening on the socket failed.
    #[error("socket setup failed: {0}")]
    Socket(#[source] std::io::Error),

    /// Writing the readiness marker failed.
    #[error("readiness marker write failed: {0}")]
    Marker(#[source] std::io::Error),
}
