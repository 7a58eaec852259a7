// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative shutdown signal for the message pump.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;
use tracing::info;

/// Cooperative shutdown token.
///
/// Cloneable and backed by an `Arc`; triggering any clone signals all
/// waiters. The pump checks it between envelopes and the router races it
/// against the in-flight dispatch.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownToken {
    /// Create a new, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown to all waiters.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` if shutdown has been signalled.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is signalled (returns immediately if already
    /// triggered).
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }

    /// Spawn a listener that triggers this token on SIGTERM or ctrl-c.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => info!(target: "asya.sidecar", "SIGTERM received"),
                _ = tokio::signal::ctrl_c() => info!(target: "asya.sidecar", "interrupt received"),
            }
            token.trigger();
        });
    }
}
