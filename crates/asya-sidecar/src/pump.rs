// SPDX-License-Identifier: MIT OR Apache-2.0
//! The receive loop: one envelope at a time, in receive order, until
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use asya_transport::{Transport, TransportError};

use crate::router::Router;
use crate::shutdown::ShutdownToken;
use crate::SidecarError;

/// Single-queue consumer driving envelopes through a [`Router`].
///
/// Sequential by design: parallelism lives between pods, and a prefetch
/// window of one keeps queue depth an honest autoscaling signal.
pub struct MessagePump {
    router: Router,
    transport: Arc<dyn Transport>,
    queue: String,
    shutdown: ShutdownToken,
}

impl MessagePump {
    /// Build a pump consuming `queue` (an already-resolved identifier).
    pub fn new(
        router: Router,
        transport: Arc<dyn Transport>,
        queue: impl Into<String>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            router,
            transport,
            queue: queue.into(),
            shutdown,
        }
    }

    /// Consume until shutdown triggers or the transport closes.
    ///
    /// Transient receive failures back off and retry: a queue outage stalls
    /// the sidecar rather than killing it, and the autoscaler reacts to the
    /// missing throughput.
    pub async fn run(&self) -> Result<(), SidecarError> {
        info!(target: "asya.sidecar", queue = %self.queue, "message pump started");
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let msg = tokio::select! {
                received = self.transport.receive(&self.queue) => match received {
                    Ok(msg) => msg,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        warn!(target: "asya.sidecar", error = %e, "receive failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.shutdown.triggered() => break,
            };

            let outcome = self.router.process(msg).await;
            debug!(target: "asya.sidecar", ?outcome, "envelope processed");
        }
        info!(target: "asya.sidecar", queue = %self.queue, "message pump stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RuntimeClient;
    use crate::router::RouterOptions;
    use asya_model::{Envelope, Route};
    use asya_transport::{naming, MemoryTransport, TransportKind};
    use asya_wire::{read_frame, write_frame, WireResponse};
    use serde_json::json;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn pump_processes_in_receive_order_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("asya.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(request) = read_frame(&mut stream).await else {
                    continue;
                };
                let input: Envelope = serde_json::from_slice(&request).unwrap();
                let response = WireResponse::Results(input.fan_out(vec![input.payload.clone()]));
                let _ = write_frame(&mut stream, &response.to_vec().unwrap()).await;
            }
        });

        let transport = MemoryTransport::new();
        let shutdown = ShutdownToken::new();
        let router = Router::new(
            RouterOptions {
                actor: "echo".into(),
                transport_kind: TransportKind::Memory,
                base_url: None,
                terminal: false,
                graceful_shutdown: Duration::from_millis(100),
            },
            Arc::new(transport.clone()),
            RuntimeClient::new(&socket, Duration::from_secs(5)),
            None,
            shutdown.clone(),
        );
        let pump = MessagePump::new(
            router,
            Arc::new(transport.clone()),
            naming::queue_name("echo"),
            shutdown.clone(),
        );

        for i in 0..3 {
            let env = Envelope::new(format!("p-{i}"), Route::new(["echo"]), json!({"i": i}));
            transport
                .send("asya-echo", &serde_json::to_vec(&env).unwrap())
                .await
                .unwrap();
        }

        let handle = tokio::spawn(async move { pump.run().await });

        // Wait until all three came out the other side.
        for _ in 0..100 {
            if transport.len("asya-success-sink") == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let outputs = transport.drain("asya-success-sink");
        assert_eq!(outputs.len(), 3);
        let ids: Vec<String> = outputs
            .iter()
            .map(|b| serde_json::from_slice::<Envelope>(b).unwrap().id)
            .collect();
        // Receive order is preserved within one sidecar.
        assert_eq!(ids, vec!["p-0", "p-1", "p-2"]);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
