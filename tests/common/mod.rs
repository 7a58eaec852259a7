// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness: real supervisors on tempdir sockets, an in-memory
//! transport, and one router per simulated actor.
#![allow(dead_code)] // not every suite uses every helper

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use asya_config::{readiness_marker, HandlerMode, RuntimeConfig};
use asya_model::Envelope;
use asya_runtime::{HandlerRegistry, Supervisor};
use asya_sidecar::{Router, RouterOptions, RuntimeClient, ShutdownToken};
use asya_transport::{naming, MemoryTransport, Transport, TransportKind};
use tempfile::TempDir;

pub struct Harness {
    pub transport: MemoryTransport,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            transport: MemoryTransport::new(),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Start a supervisor for `actor` and return a router wired to it.
    pub async fn actor(
        &self,
        actor: &str,
        registry: HandlerRegistry,
        handler: &str,
        mode: HandlerMode,
        timeout: Duration,
    ) -> Router {
        let socket = self.start_runtime(actor, registry, handler, mode).await;
        self.router(actor, socket, false, timeout)
    }

    /// Start a terminal (sink) router backed by a consuming handler.
    pub async fn sink(&self, actor: &str) -> Router {
        let socket = self
            .start_runtime(
                actor,
                asya_runtime::builtins::registry(),
                "builtin.consume",
                HandlerMode::Payload,
            )
            .await;
        self.router(actor, socket, true, Duration::from_secs(5))
    }

    async fn start_runtime(
        &self,
        actor: &str,
        registry: HandlerRegistry,
        handler: &str,
        mode: HandlerMode,
    ) -> PathBuf {
        let socket = self.dir.path().join(actor).join("asya.sock");
        let config = RuntimeConfig {
            handler: handler.to_string(),
            handler_mode: mode,
            socket_path: socket.clone(),
            socket_chmod: 0o660,
            processing_timeout: Duration::from_secs(30),
            enable_oom_detection: true,
            cuda_cleanup_on_oom: false,
        };
        let supervisor = Supervisor::new(config, &registry).expect("resolve handler");
        tokio::spawn(async move { supervisor.serve().await });

        let marker = readiness_marker(&socket);
        for _ in 0..200 {
            if marker.exists() && socket.exists() {
                return socket;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runtime for {actor} never became ready");
    }

    fn router(&self, actor: &str, socket: PathBuf, terminal: bool, timeout: Duration) -> Router {
        Router::new(
            RouterOptions {
                actor: actor.to_string(),
                transport_kind: TransportKind::Memory,
                base_url: None,
                terminal,
                graceful_shutdown: Duration::from_secs(1),
            },
            Arc::new(self.transport.clone()),
            RuntimeClient::new(socket, timeout),
            None,
            ShutdownToken::new(),
        )
    }

    /// Put `envelope` on the queue of its current actor.
    pub async fn admit(&self, envelope: &Envelope) {
        let actor = envelope
            .route
            .current_actor()
            .expect("admitted envelope has an active route");
        self.transport
            .send(
                &naming::queue_name(actor),
                &serde_json::to_vec(envelope).unwrap(),
            )
            .await
            .unwrap();
    }

    /// Pull one message off `actor`'s queue and run it through `router`.
    pub async fn step(&self, router: &Router, actor: &str) -> asya_sidecar::Outcome {
        let msg = self
            .transport
            .receive(&naming::queue_name(actor))
            .await
            .unwrap();
        router.process(msg).await
    }

    /// Drain a queue into parsed envelopes.
    pub fn envelopes_on(&self, queue: &str) -> Vec<Envelope> {
        self.transport
            .drain(queue)
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }
}
