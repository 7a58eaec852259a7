// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-transport
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;

pub mod amqp;
pub mod memory;
pub mod naming;
pub mod sqs;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;
pub use naming::{queue_name, resolve, TransportKind, QUEUE_PREFIX};
pub use sqs::SqsTransport;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a transport. These are all transient from the
/// router's point of view: a failed receive or publish leads to redelivery,
/// never to a synthesized error envelope.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connecting or authenticating to the broker failed.
    #[error("transport connect failed: {0}")]
    Connect(String),

    /// Receiving from a queue failed.
    #[error("receive from '{queue}' failed: {reason}")]
    Receive {
        /// Queue identifier.
        queue: String,
        /// Underlying failure.
        reason: String,
    },

    /// Publishing to a queue failed.
    #[error("publish to '{queue}' failed: {reason}")]
    Publish {
        /// Queue identifier.
        queue: String,
        /// Underlying failure.
        reason: String,
    },

    /// Acknowledging (or rejecting) a delivery failed.
    #[error("acknowledge failed: {0}")]
    Ack(String),

    /// A queue administration call (declare, depth, delete) failed.
    #[error("queue admin operation failed: {0}")]
    Admin(String),

    /// The queue could not be deleted because it still holds messages.
    #[error("queue '{0}' is not empty")]
    QueueNotEmpty(String),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Data-path interface
// ---------------------------------------------------------------------------

/// One message pulled from a queue, owned by the receiving sidecar until it
/// is acked or nacked.
#[async_trait]
pub trait InboundMessage: Send {
    /// Raw message bytes.
    fn body(&self) -> &[u8];

    /// Whether the broker marked this delivery as a redelivery.
    fn redelivered(&self) -> bool;

    /// Positively acknowledge: the message is done and must not come back.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Negatively acknowledge: return the message for redelivery.
    async fn nack(self: Box<Self>) -> Result<(), TransportError>;
}

/// The queue interface the sidecar runs against.
///
/// `queue` arguments are resolved identifiers from [`naming::resolve`] — a
/// plain queue name for broker transports, a full URL for URL-addressed
/// ones. Resolution is the caller's job so that next-hop, success-sink, and
/// error-sink destinations all go through the same pure function.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Block until one message is available on `queue`.
    ///
    /// Implementations must be cancel-safe: dropping the future before it
    /// resolves must not lose a message.
    async fn receive(&self, queue: &str) -> Result<Box<dyn InboundMessage>, TransportError>;

    /// Publish `body` to `queue`.
    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Release connections. Subsequent calls fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Control-path interface
// ---------------------------------------------------------------------------

/// Queue administration, used by the control plane (and by sidecars to
/// declare their own queue on startup). Takes actor names, not resolved
/// identifiers; each implementation applies its own resolution.
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Idempotently ensure the actor's queue exists. Never recreates an
    /// existing queue.
    async fn ensure(&self, actor: &str) -> Result<(), TransportError>;

    /// Best-effort message count, `None` when the transport cannot tell.
    async fn depth(&self, actor: &str) -> Result<Option<u64>, TransportError>;

    /// Delete the actor's queue only when it is verifiably empty. Returns
    /// `Err(QueueNotEmpty)` otherwise.
    async fn delete_if_empty(&self, actor: &str) -> Result<(), TransportError>;
}
