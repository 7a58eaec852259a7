// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic queue naming. No central registry: every component that
//! needs a destination computes it from the actor name alone.

use std::fmt;
use std::str::FromStr;

/// Prefix applied to every actor queue.
pub const QUEUE_PREFIX: &str = "asya-";

/// Which transport plug-in a queue identifier targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// AMQP broker with a shared topic exchange.
    Amqp,
    /// Cloud SQS-style queues addressed by URL.
    Sqs,
    /// In-process transport for tests and local runs.
    Memory,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "sqs" => Ok(Self::Sqs),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Amqp => "amqp",
            Self::Sqs => "sqs",
            Self::Memory => "memory",
        })
    }
}

/// Queue name for an actor: `asya-<actorName>`.
pub fn queue_name(actor: &str) -> String {
    format!("{QUEUE_PREFIX}{actor}")
}

/// Resolve an actor name to the transport-specific queue identifier.
///
/// Pure: the same `(kind, actor, base_url)` always yields the same
/// identifier. Used uniformly for the next hop, the success sink, and the
/// error sink.
pub fn resolve(kind: TransportKind, actor: &str, base_url: Option<&str>) -> String {
    let queue = queue_name(actor);
    match kind {
        TransportKind::Amqp | TransportKind::Memory => queue,
        TransportKind::Sqs => match base_url {
            Some(base) => format!("{}/{queue}", base.trim_end_matches('/')),
            None => queue,
        },
    }
}
