// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler trait and the compiled-in registry that stands in for dynamic
//! import.
//!
//! The wire contract addresses handlers by locator string
//! (`module.function` or `module.Class.method`). A compiled language cannot
//! import at runtime, so images register their handlers under those locator
//! names at startup; class-method locators register a single shared
//! instance, which gives the same once-per-process construction semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use asya_model::Envelope;

use crate::RuntimeError;

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// What a payload-mode handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// No continuation; the pipeline ends successfully here.
    None,
    /// One downstream payload.
    One(Value),
    /// Fan-out: one downstream envelope per payload.
    Many(Vec<Value>),
}

/// What an envelope-mode handler produced. The handler owns route
/// advancement; the supervisor only validates it.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeResult {
    /// No continuation.
    None,
    /// One complete result envelope.
    One(Envelope),
    /// Fan-out of complete result envelopes.
    Many(Vec<Envelope>),
}

/// A failure raised by a handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Host memory exhaustion.
    #[error("out of memory: {0}")]
    Oom(String),

    /// GPU memory exhaustion.
    #[error("gpu out of memory: {0}")]
    CudaOom(String),

    /// Any other failure, carrying the handler's error class name.
    #[error("{class}: {message}")]
    Failure {
        /// Error class name, reported back over the wire.
        class: String,
        /// Human-readable description.
        message: String,
    },
}

impl HandlerError {
    /// Ordinary failure with a class name and message.
    pub fn failure(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            class: class.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// User-supplied processing logic.
///
/// Implement [`call`](Handler::call) for payload mode. Envelope-mode
/// handlers additionally override [`call_envelope`](Handler::call_envelope);
/// the default rejects envelope mode so a misconfigured mode fails loudly
/// instead of silently mangling routes.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Payload mode: transform one payload into zero or more payloads.
    async fn call(&self, payload: Value) -> Result<HandlerResult, HandlerError>;

    /// Envelope mode: transform one envelope into zero or more complete
    /// envelopes, advancing `route.current` along the way.
    async fn call_envelope(&self, envelope: Envelope) -> Result<EnvelopeResult, HandlerError> {
        let _ = envelope;
        Err(HandlerError::failure(
            "UnsupportedMode",
            "handler does not implement envelope mode",
        ))
    }
}

/// Adapter turning an async-free closure into a payload-mode [`Handler`].
/// Mostly useful in tests and small built-ins.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Value) -> Result<HandlerResult, HandlerError> + Send + Sync,
{
    async fn call(&self, payload: Value) -> Result<HandlerResult, HandlerError> {
        (self.0)(payload)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Compiled-in table of handlers, keyed by locator string.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// New, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `locator`. Later registrations replace
    /// earlier ones, so images can shadow built-ins.
    pub fn register(&mut self, locator: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(locator.into(), Arc::new(handler));
    }

    /// Resolve a locator to its handler, validating the locator shape
    /// first.
    pub fn resolve(&self, locator: &str) -> Result<Arc<dyn Handler>, RuntimeError> {
        validate_locator(locator)?;
        self.handlers
            .get(locator)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownHandler(locator.to_string()))
    }

    /// Registered locator names, for startup diagnostics.
    pub fn locators(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// A locator is two or three non-empty dot-separated segments:
/// `module.function` or `module.Class.method`.
fn validate_locator(locator: &str) -> Result<(), RuntimeError> {
    let segments: Vec<&str> = locator.split('.').collect();
    let ok = matches!(segments.len(), 2 | 3) && segments.iter().all(|s| !s.is_empty());
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::InvalidLocator(locator.to_string()))
    }
}
