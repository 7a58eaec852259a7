// SPDX-License-Identifier: MIT OR Apache-2.0
//! Progress reporting to the optional tracker collaborator.
//!
//! Reporting is fire-and-forget: a dead or slow tracker must never block
//! envelope processing, so updates go out on spawned tasks and failures are
//! logged at debug.

use serde::Serialize;
use tracing::debug;

/// Lifecycle states reported per envelope per actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// The envelope was pulled off the queue.
    Received,
    /// The envelope was handed to the runtime.
    Processing,
    /// Processing finished (in success or in error) and the original was
    /// acknowledged.
    Completed,
}

/// One progress update for `POST <tracker>/envelopes/{id}/progress`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// The envelope's semantic id.
    pub envelope_id: String,
    /// Name of the pipeline step (the actor).
    pub step: String,
    /// Position of this actor in the route.
    pub step_index: usize,
    /// Number of actors in the route. Sinks are not counted.
    pub total_steps: usize,
    /// Lifecycle state.
    pub status: ProgressStatus,
    /// Reporting actor.
    pub actor_name: String,
    /// Wall-clock duration of the step, for `completed` updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Payload size in kilobytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<u64>,
    /// Free-form detail, used for error summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Client for the tracker endpoint.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    client: reqwest::Client,
    base_url: String,
}

impl ProgressReporter {
    /// Build a reporter for `base_url` (no trailing slash required).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Post one progress update and wait for the result. The router wraps
    /// this in [`report`](Self::report) to stay off the critical path.
    pub async fn progress(&self, update: ProgressUpdate) {
        let url = format!("{}/envelopes/{}/progress", self.base_url, update.envelope_id);
        if let Err(e) = self.client.post(&url).json(&update).send().await {
            debug!(target: "asya.sidecar", error = %e, "progress report failed");
        }
    }

    /// Post the terminal status for an envelope, used by sink sidecars.
    pub async fn finalize(&self, update: ProgressUpdate) {
        let url = format!("{}/envelopes/{}/final", self.base_url, update.envelope_id);
        if let Err(e) = self.client.post(&url).json(&update).send().await {
            debug!(target: "asya.sidecar", error = %e, "final report failed");
        }
    }

    /// Fire-and-forget progress update.
    pub fn report(&self, update: ProgressUpdate) {
        let reporter = self.clone();
        tokio::spawn(async move { reporter.progress(update).await });
    }

    /// Fire-and-forget final update.
    pub fn report_final(&self, update: ProgressUpdate) {
        let reporter = self.clone();
        tokio::spawn(async move { reporter.finalize(update).await });
    }
}
