// SPDX-License-Identifier: MIT OR Apache-2.0
//! AMQP transport: one durable topic exchange, durable queues bound by
//! routing key, persistent delivery.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{naming, InboundMessage, QueueAdmin, Transport, TransportError};

/// The single exchange every actor queue binds to.
pub const EXCHANGE: &str = "asya";

/// AMQP delivery mode 2: persist messages to disk.
const PERSISTENT: u8 = 2;

/// Transport over an AMQP broker.
///
/// One connection, one channel. Consumers are created lazily per queue and
/// cached; prefetch bounds the in-flight window so queue depth stays an
/// honest backpressure signal.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl AmqpTransport {
    /// Connect to the broker at `url` and apply `prefetch` as the channel
    /// QoS window.
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, TransportError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(target: "asya.transport", url, prefetch, "amqp connected");
        Ok(Self {
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Declare the shared exchange plus a durable, non-auto-deleted queue
    /// bound by its own name as routing key.
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        self.channel
            .queue_bind(
                queue,
                EXCHANGE,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        Ok(())
    }

    async fn passive_depth(&self, queue: &str) -> Result<u64, TransportError> {
        let state = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        Ok(u64::from(state.message_count()))
    }
}

struct AmqpMessage {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl InboundMessage for AmqpMessage {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        self.delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn receive(&self, queue: &str) -> Result<Box<dyn InboundMessage>, TransportError> {
        let mut consumers = self.consumers.lock().await;
        if !consumers.contains_key(queue) {
            self.declare(queue).await?;
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    &format!("{queue}-sidecar"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Receive {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })?;
            consumers.insert(queue.to_string(), consumer);
        }
        let consumer = consumers.get_mut(queue).expect("consumer just inserted");
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Box::new(AmqpMessage { delivery })),
            Some(Err(e)) => Err(TransportError::Receive {
                queue: queue.to_string(),
                reason: e.to_string(),
            }),
            None => Err(TransportError::Closed),
        }
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        self.declare(queue).await?;
        let confirm = self
            .channel
            .basic_publish(
                EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| TransportError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        confirm.await.map_err(|e| TransportError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(200, "sidecar shutdown")
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))
    }
}

#[async_trait]
impl QueueAdmin for AmqpTransport {
    async fn ensure(&self, actor: &str) -> Result<(), TransportError> {
        self.declare(&naming::queue_name(actor)).await
    }

    async fn depth(&self, actor: &str) -> Result<Option<u64>, TransportError> {
        self.passive_depth(&naming::queue_name(actor))
            .await
            .map(Some)
    }

    async fn delete_if_empty(&self, actor: &str) -> Result<(), TransportError> {
        let queue = naming::queue_name(actor);
        if self.passive_depth(&queue).await? > 0 {
            return Err(TransportError::QueueNotEmpty(queue));
        }
        // if_empty guards the window between the depth check and the delete.
        self.channel
            .queue_delete(
                &queue,
                QueueDeleteOptions {
                    if_empty: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|_| TransportError::QueueNotEmpty(queue.clone()))?;
        Ok(())
    }
}
