// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory transport: the full `Transport`/`QueueAdmin` contract over
//! process-local queues, with redelivery on nack.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{naming, InboundMessage, QueueAdmin, Transport, TransportError};

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Stored>>,
}

/// Process-local transport. Cloning shares the underlying queues, so a test
/// can hold one clone per simulated sidecar.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// New, empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently queued on `queue`.
    pub fn len(&self, queue: &str) -> usize {
        let state = self.state.lock().expect("transport lock poisoned");
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Whether `queue` currently holds no messages.
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Take every queued message off `queue`. Test helper.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().expect("transport lock poisoned");
        state
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    fn push(&self, queue: &str, message: Stored, front: bool) {
        let mut state = self.state.lock().expect("transport lock poisoned");
        let q = state.queues.entry(queue.to_string()).or_default();
        if front {
            q.push_front(message);
        } else {
            q.push_back(message);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<Stored> {
        let mut state = self.state.lock().expect("transport lock poisoned");
        state.queues.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

struct MemoryMessage {
    transport: MemoryTransport,
    queue: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[async_trait]
impl InboundMessage for MemoryMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        // Redelivery goes to the head of the queue, like a broker requeue.
        self.transport.push(
            &self.queue,
            Stored {
                body: self.body,
                redelivered: true,
            },
            true,
        );
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&self, queue: &str) -> Result<Box<dyn InboundMessage>, TransportError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            if let Some(stored) = self.pop(queue) {
                return Ok(Box::new(MemoryMessage {
                    transport: self.clone(),
                    queue: queue.to_string(),
                    body: stored.body,
                    redelivered: stored.redelivered,
                }));
            }
            self.notify.notified().await;
        }
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.push(
            queue,
            Stored {
                body: body.to_vec(),
                redelivered: false,
            },
            false,
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for MemoryTransport {
    async fn ensure(&self, actor: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("transport lock poisoned");
        state.queues.entry(naming::queue_name(actor)).or_default();
        Ok(())
    }

    async fn depth(&self, actor: &str) -> Result<Option<u64>, TransportError> {
        Ok(Some(self.len(&naming::queue_name(actor)) as u64))
    }

    async fn delete_if_empty(&self, actor: &str) -> Result<(), TransportError> {
        let queue = naming::queue_name(actor);
        let mut state = self.state.lock().expect("transport lock poisoned");
        match state.queues.get(&queue) {
            Some(q) if !q.is_empty() => Err(TransportError::QueueNotEmpty(queue)),
            _ => {
                state.queues.remove(&queue);
                Ok(())
            }
        }
    }
}
