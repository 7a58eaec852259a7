// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQS-style transport: URL-addressed queues, long-poll receive, visibility
//! timeout matched to the processing deadline.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use tracing::debug;

use crate::{naming, InboundMessage, QueueAdmin, Transport, TransportError};

/// Longest legal SQS long-poll wait.
const LONG_POLL_SECS: i32 = 20;

/// Transport over SQS-compatible queues.
///
/// Data-path `queue` arguments are full queue URLs (see
/// [`naming::resolve`]); admin calls take actor names and look the URL up.
pub struct SqsTransport {
    client: Client,
    visibility_timeout: Duration,
}

impl SqsTransport {
    /// Build from an already-configured SDK client.
    ///
    /// `visibility_timeout` should match the sidecar's processing deadline:
    /// a message stays invisible exactly as long as one attempt may run.
    pub fn new(client: Client, visibility_timeout: Duration) -> Self {
        Self {
            client,
            visibility_timeout,
        }
    }

    /// Build a client from the ambient AWS environment.
    pub async fn from_env(visibility_timeout: Duration) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), visibility_timeout)
    }

    async fn queue_url(&self, actor: &str) -> Result<String, TransportError> {
        let out = self
            .client
            .get_queue_url()
            .queue_name(naming::queue_name(actor))
            .send()
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        out.queue_url()
            .map(str::to_string)
            .ok_or_else(|| TransportError::Admin("queue url missing in response".into()))
    }

    async fn approximate_depth(&self, queue_url: &str) -> Result<u64, TransportError> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        let depth = out
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(depth)
    }
}

struct SqsMessage {
    client: Client,
    queue_url: String,
    receipt_handle: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[async_trait]
impl InboundMessage for SqsMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        // Dropping the visibility timeout to zero hands the message straight
        // back to the queue.
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SqsTransport {
    async fn receive(&self, queue: &str) -> Result<Box<dyn InboundMessage>, TransportError> {
        loop {
            let out = self
                .client
                .receive_message()
                .queue_url(queue)
                .max_number_of_messages(1)
                .wait_time_seconds(LONG_POLL_SECS)
                .visibility_timeout(self.visibility_timeout.as_secs() as i32)
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .send()
                .await
                .map_err(|e| TransportError::Receive {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })?;

            let Some(message) = out.messages().first().cloned() else {
                // Long poll expired without traffic; poll again.
                continue;
            };

            let receipt_handle = message.receipt_handle().map(str::to_string).ok_or_else(|| {
                TransportError::Receive {
                    queue: queue.to_string(),
                    reason: "message without receipt handle".into(),
                }
            })?;
            let redelivered = message
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse::<u32>().ok())
                .is_some_and(|count| count > 1);

            debug!(target: "asya.transport", queue, redelivered, "sqs message received");
            return Ok(Box::new(SqsMessage {
                client: self.client.clone(),
                queue_url: queue.to_string(),
                receipt_handle,
                body: message.body().unwrap_or_default().as_bytes().to_vec(),
                redelivered,
            }));
        }
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let body = String::from_utf8(body.to_vec()).map_err(|e| TransportError::Publish {
            queue: queue.to_string(),
            reason: format!("envelope is not utf-8: {e}"),
        })?;
        self.client
            .send_message()
            .queue_url(queue)
            .message_body(body)
            .send()
            .await
            .map_err(|e| TransportError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // The SDK client holds no per-queue state worth tearing down.
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for SqsTransport {
    async fn ensure(&self, actor: &str) -> Result<(), TransportError> {
        self.client
            .create_queue()
            .queue_name(naming::queue_name(actor))
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                self.visibility_timeout.as_secs().to_string(),
            )
            .send()
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        Ok(())
    }

    async fn depth(&self, actor: &str) -> Result<Option<u64>, TransportError> {
        let url = self.queue_url(actor).await?;
        self.approximate_depth(&url).await.map(Some)
    }

    async fn delete_if_empty(&self, actor: &str) -> Result<(), TransportError> {
        let url = self.queue_url(actor).await?;
        if self.approximate_depth(&url).await? > 0 {
            return Err(TransportError::QueueNotEmpty(naming::queue_name(actor)));
        }
        self.client
            .delete_queue()
            .queue_url(&url)
            .send()
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        Ok(())
    }
}
