// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deadline-bounded dispatch of one envelope to the runtime socket.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::debug;

use asya_model::Envelope;
use asya_wire::{read_frame, write_json, WireResponse};

/// Failures during a dispatch, already shaped for error classification.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The processing deadline elapsed. Dropping the connection is what
    /// cancels the handler: the supervisor sees a read error and discards
    /// the in-flight work.
    #[error("runtime did not answer within {0:?}")]
    Timeout(Duration),

    /// Dialing, writing, reading, or decoding failed.
    #[error("runtime connection failed: {0}")]
    Connection(String),
}

/// Client side of the sidecar ↔ runtime protocol.
///
/// One fresh connection per envelope: no pooling, no state bleeding between
/// requests, and a hard deadline enforced by abandoning the socket.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl RuntimeClient {
    /// Build a client for the runtime listening at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// The configured processing deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `envelope` and wait for the framed response, up to the deadline.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<WireResponse, DispatchError> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| DispatchError::Connection(format!("dial: {e}")))?;
            write_json(&mut stream, envelope)
                .await
                .map_err(|e| DispatchError::Connection(format!("write: {e}")))?;
            let bytes = read_frame(&mut stream)
                .await
                .map_err(|e| DispatchError::Connection(format!("read: {e}")))?;
            WireResponse::from_slice(&bytes)
                .map_err(|e| DispatchError::Connection(format!("decode: {e}")))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    target: "asya.sidecar",
                    envelope = %envelope.id,
                    timeout = ?self.timeout,
                    "dispatch deadline elapsed, dropping connection"
                );
                Err(DispatchError::Timeout(self.timeout))
            }
        }
    }
}
