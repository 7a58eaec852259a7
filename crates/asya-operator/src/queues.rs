// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue provisioning seam. The reconciler talks to this trait; production
//! wires it to the real transports, tests stub it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use asya_transport::{AmqpTransport, QueueAdmin, SqsTransport, TransportError};

use crate::crd::TransportName;

/// Control-plane queue operations, keyed by the actor's transport.
#[async_trait]
pub trait QueueProvisioner: Send + Sync {
    /// Idempotently ensure the actor's queue exists. Existing queues are
    /// never recreated, so messages survive spec updates.
    async fn ensure(&self, transport: TransportName, actor: &str) -> Result<(), TransportError>;

    /// Delete the queue only when verifiably empty.
    async fn delete_if_empty(
        &self,
        transport: TransportName,
        actor: &str,
    ) -> Result<(), TransportError>;

    /// Best-effort queue depth for status reporting.
    async fn depth(
        &self,
        transport: TransportName,
        actor: &str,
    ) -> Result<Option<u64>, TransportError>;
}

/// Production provisioner over the configured transports. A transport left
/// unconfigured turns its operations into admin errors, which surface as
/// `TransportError` status on the affected actors.
pub struct TransportProvisioner {
    amqp: Option<AmqpTransport>,
    sqs: Option<SqsTransport>,
}

impl TransportProvisioner {
    /// Connect whichever transports the operator was configured for.
    pub async fn connect(
        amqp_url: Option<&str>,
        enable_sqs: bool,
        visibility_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let amqp = match amqp_url {
            Some(url) => {
                let transport = AmqpTransport::connect(url, 1).await?;
                info!(target: "asya.operator", "amqp provisioning enabled");
                Some(transport)
            }
            None => None,
        };
        let sqs = if enable_sqs {
            info!(target: "asya.operator", "sqs provisioning enabled");
            Some(SqsTransport::from_env(visibility_timeout).await)
        } else {
            None
        };
        Ok(Self { amqp, sqs })
    }

    fn admin(&self, transport: TransportName) -> Result<&dyn QueueAdmin, TransportError> {
        match transport {
            TransportName::Amqp => self
                .amqp
                .as_ref()
                .map(|t| t as &dyn QueueAdmin)
                .ok_or_else(|| TransportError::Admin("amqp transport not configured".into())),
            TransportName::Sqs => self
                .sqs
                .as_ref()
                .map(|t| t as &dyn QueueAdmin)
                .ok_or_else(|| TransportError::Admin("sqs transport not configured".into())),
        }
    }
}

#[async_trait]
impl QueueProvisioner for TransportProvisioner {
    async fn ensure(&self, transport: TransportName, actor: &str) -> Result<(), TransportError> {
        self.admin(transport)?.ensure(actor).await
    }

    async fn delete_if_empty(
        &self,
        transport: TransportName,
        actor: &str,
    ) -> Result<(), TransportError> {
        self.admin(transport)?.delete_if_empty(actor).await
    }

    async fn depth(
        &self,
        transport: TransportName,
        actor: &str,
    ) -> Result<Option<u64>, TransportError> {
        self.admin(transport)?.depth(actor).await
    }
}
