// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-envelope state machine: receive, validate, dispatch, forward,
//! acknowledge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use asya_model::{Destination, Envelope, ErrorCode, Route, ERROR_SINK, SUCCESS_SINK};
use asya_transport::{naming, InboundMessage, Transport, TransportKind};
use asya_wire::WireResponse;

use crate::dispatch::{DispatchError, RuntimeClient};
use crate::shutdown::ShutdownToken;
use crate::tracker::{ProgressReporter, ProgressStatus, ProgressUpdate};

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Static routing identity of one sidecar.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// The actor this sidecar serves.
    pub actor: String,
    /// Transport flavor, for destination resolution.
    pub transport_kind: TransportKind,
    /// Base URL for URL-addressed transports.
    pub base_url: Option<String>,
    /// Terminal-sink mode: consume, dispatch, ack; never publish.
    pub terminal: bool,
    /// Budget granted to the in-flight envelope once shutdown triggers.
    pub graceful_shutdown: Duration,
}

/// What happened to one queue message. Exactly one of these per delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `k ≥ 1` downstream envelopes published, original acked.
    Forwarded(usize),
    /// Envelope routed to the success sink, original acked.
    SuccessSink,
    /// One error envelope published to the error sink, original acked.
    ErrorSink(ErrorCode),
    /// Terminal mode: runtime response discarded, original acked.
    TerminalAck,
    /// Transient fault or shutdown: original returned for redelivery.
    Nacked,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Drives one envelope at a time through the runtime and out to the next
/// queue. All state here is configuration; every per-envelope decision is
/// local to [`process`](Router::process).
pub struct Router {
    options: RouterOptions,
    transport: Arc<dyn Transport>,
    client: RuntimeClient,
    reporter: Option<ProgressReporter>,
    shutdown: ShutdownToken,
}

impl Router {
    /// Build a router over `transport` and a runtime at `client`.
    pub fn new(
        options: RouterOptions,
        transport: Arc<dyn Transport>,
        client: RuntimeClient,
        reporter: Option<ProgressReporter>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            options,
            transport,
            client,
            reporter,
            shutdown,
        }
    }

    fn resolve(&self, actor: &str) -> String {
        naming::resolve(
            self.options.transport_kind,
            actor,
            self.options.base_url.as_deref(),
        )
    }

    /// Wait for shutdown, then let the graceful budget run out.
    async fn grace_elapsed(&self) {
        self.shutdown.triggered().await;
        tokio::time::sleep(self.options.graceful_shutdown).await;
    }

    /// Process one delivery to completion. Infallible by design: every
    /// failure mode maps to an [`Outcome`].
    pub async fn process(&self, msg: Box<dyn InboundMessage>) -> Outcome {
        let started = Instant::now();
        let body = msg.body().to_vec();
        if msg.redelivered() {
            debug!(target: "asya.sidecar", actor = %self.options.actor, "processing redelivery");
        }

        // RECEIVED → VALIDATED
        let envelope = match serde_json::from_slice::<Envelope>(&body) {
            Ok(envelope) => match envelope.validate_active() {
                Ok(()) => envelope,
                Err(violation) => {
                    warn!(
                        target: "asya.sidecar",
                        envelope = %envelope.id,
                        error = %violation,
                        "envelope violates route invariants"
                    );
                    if self.options.terminal {
                        self.ack(msg).await;
                        return Outcome::TerminalAck;
                    }
                    let error = envelope.to_error(
                        ErrorCode::InvalidJson,
                        violation.to_string(),
                        None,
                        Some(self.options.actor.clone()),
                    );
                    return self.publish_error(msg, error).await;
                }
            },
            Err(parse_err) => {
                warn!(target: "asya.sidecar", error = %parse_err, "unparseable queue message");
                if self.options.terminal {
                    self.ack(msg).await;
                    return Outcome::TerminalAck;
                }
                // No identity to recover; synthesize one so the error sink
                // still receives exactly one well-formed envelope.
                let error = Envelope {
                    id: format!("unparsed-{}", Uuid::new_v4()),
                    route: Route {
                        actors: vec![self.options.actor.clone()],
                        current: 0,
                    },
                    headers: Default::default(),
                    payload: Value::String(String::from_utf8_lossy(&body).into_owned()),
                    error: None,
                }
                .to_error(
                    ErrorCode::InvalidJson,
                    parse_err.to_string(),
                    None,
                    Some(self.options.actor.clone()),
                );
                return self.publish_error(msg, error).await;
            }
        };

        // Input mismatch is a warning only; the message is still processed.
        if envelope.route.current_actor() != Some(self.options.actor.as_str()) {
            warn!(
                target: "asya.sidecar",
                envelope = %envelope.id,
                expected = %self.options.actor,
                got = ?envelope.route.current_actor(),
                "envelope addressed to a different actor"
            );
        }

        self.report(&envelope, ProgressStatus::Received, None, None);

        if self.options.terminal {
            return self.process_terminal(msg, envelope, started).await;
        }

        // VALIDATED → DISPATCHED
        self.report(&envelope, ProgressStatus::Processing, None, None);
        let response = tokio::select! {
            response = self.client.dispatch(&envelope) => response,
            _ = self.grace_elapsed() => {
                info!(target: "asya.sidecar", envelope = %envelope.id, "graceful budget exhausted, returning envelope");
                self.nack(msg).await;
                return Outcome::Nacked;
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(dispatch_err) => {
                let code = match dispatch_err {
                    DispatchError::Timeout(_) => ErrorCode::TimeoutError,
                    DispatchError::Connection(_) => ErrorCode::ConnectionError,
                };
                let error = envelope.to_error(
                    code,
                    dispatch_err.to_string(),
                    None,
                    Some(self.options.actor.clone()),
                );
                let outcome = self.publish_error(msg, error).await;
                self.report_completed(&envelope, started);
                return outcome;
            }
        };

        // DISPATCHED → FORWARDED | ERROR_REPORTED
        let outcome = match response {
            WireResponse::Error(err) => {
                let error = envelope.to_error(
                    err.code,
                    err.message.clone(),
                    err.class.clone(),
                    Some(self.options.actor.clone()),
                );
                self.publish_error(msg, error).await
            }
            WireResponse::NoContinuation => {
                // The original envelope, unadvanced, terminates at the
                // success sink.
                if self
                    .publish_and_ack(msg, vec![(self.resolve(SUCCESS_SINK), envelope.clone())])
                    .await
                {
                    Outcome::SuccessSink
                } else {
                    Outcome::Nacked
                }
            }
            WireResponse::Results(results) => self.forward(msg, &envelope, results).await,
        };

        self.report_completed(&envelope, started);
        outcome
    }

    /// Terminal sinks call the runtime for its side effects, discard the
    /// response, and ack no matter what. This is what breaks the loop when a
    /// sink handler produces output.
    async fn process_terminal(
        &self,
        msg: Box<dyn InboundMessage>,
        envelope: Envelope,
        started: Instant,
    ) -> Outcome {
        if let Err(e) = self.client.dispatch(&envelope).await {
            warn!(
                target: "asya.sidecar",
                envelope = %envelope.id,
                error = %e,
                "terminal dispatch failed; acking anyway"
            );
        }
        self.ack(msg).await;
        if let Some(reporter) = &self.reporter {
            let message = envelope
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message));
            reporter.report_final(ProgressUpdate {
                envelope_id: envelope.id.clone(),
                step: self.options.actor.clone(),
                step_index: envelope.route.current,
                total_steps: envelope.route.actors.len(),
                status: ProgressStatus::Completed,
                actor_name: self.options.actor.clone(),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                size_kb: None,
                message,
            });
        }
        Outcome::TerminalAck
    }

    /// Validate result envelopes against the return-path contract and
    /// publish each to its next hop.
    async fn forward(
        &self,
        msg: Box<dyn InboundMessage>,
        input: &Envelope,
        results: Vec<Envelope>,
    ) -> Outcome {
        for out in &results {
            let violation = if out.route.validate().is_err() {
                Some("returned envelope carries an invalid route")
            } else if input.route.prefix_preserved(&out.route).is_err() {
                Some("returned envelope altered the processed prefix of route.actors")
            } else if out
                .route
                .actors
                .get(input.route.current)
                .is_some_and(|slot| slot != &self.options.actor)
            {
                Some("returned envelope renamed the processing actor's route slot")
            } else {
                None
            };
            if let Some(reason) = violation {
                warn!(target: "asya.sidecar", envelope = %input.id, reason, "rejecting runtime results");
                let error = input.to_error(
                    ErrorCode::ProcessingError,
                    reason,
                    None,
                    Some(self.options.actor.clone()),
                );
                return self.publish_error(msg, error).await;
            }
        }

        let publishes: Vec<(String, Envelope)> = results
            .into_iter()
            .map(|out| {
                let queue = match out.route.destination() {
                    Destination::Actor(actor) => self.resolve(actor),
                    Destination::SuccessSink => self.resolve(SUCCESS_SINK),
                };
                (queue, out)
            })
            .collect();
        let count = publishes.len();
        if self.publish_and_ack(msg, publishes).await {
            Outcome::Forwarded(count)
        } else {
            Outcome::Nacked
        }
    }

    /// Publish one error envelope to the error sink and ack the original.
    async fn publish_error(&self, msg: Box<dyn InboundMessage>, error: Envelope) -> Outcome {
        let code = error
            .error
            .as_ref()
            .map(|e| e.code)
            .unwrap_or(ErrorCode::ProcessingError);
        if self
            .publish_and_ack(msg, vec![(self.resolve(ERROR_SINK), error)])
            .await
        {
            Outcome::ErrorSink(code)
        } else {
            Outcome::Nacked
        }
    }

    /// The ack-after-publish discipline: every publish must land before the
    /// original is acknowledged. Any publish failure nacks instead — a crash
    /// or fault here can duplicate downstream envelopes, never lose them.
    async fn publish_and_ack(
        &self,
        msg: Box<dyn InboundMessage>,
        publishes: Vec<(String, Envelope)>,
    ) -> bool {
        for (queue, envelope) in &publishes {
            let bytes = match serde_json::to_vec(envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(target: "asya.sidecar", error = %e, "result serialization failed");
                    self.nack(msg).await;
                    return false;
                }
            };
            if let Err(e) = self.transport.send(queue, &bytes).await {
                warn!(target: "asya.sidecar", queue = %queue, error = %e, "publish failed, returning envelope");
                self.nack(msg).await;
                return false;
            }
        }
        self.ack(msg).await;
        true
    }

    async fn ack(&self, msg: Box<dyn InboundMessage>) {
        if let Err(e) = msg.ack().await {
            // The broker will redeliver; at-least-once absorbs this.
            warn!(target: "asya.sidecar", error = %e, "ack failed");
        }
    }

    async fn nack(&self, msg: Box<dyn InboundMessage>) {
        if let Err(e) = msg.nack().await {
            warn!(target: "asya.sidecar", error = %e, "nack failed");
        }
    }

    fn report(
        &self,
        envelope: &Envelope,
        status: ProgressStatus,
        duration_ms: Option<u64>,
        message: Option<String>,
    ) {
        if let Some(reporter) = &self.reporter {
            reporter.report(ProgressUpdate {
                envelope_id: envelope.id.clone(),
                step: self.options.actor.clone(),
                step_index: envelope.route.current,
                total_steps: envelope.route.actors.len(),
                status,
                actor_name: self.options.actor.clone(),
                duration_ms,
                size_kb: Some((serde_json::to_vec(&envelope.payload).map_or(0, |b| b.len()) / 1024) as u64),
                message,
            });
        }
    }

    fn report_completed(&self, envelope: &Envelope, started: Instant) {
        self.report(
            envelope,
            ProgressStatus::Completed,
            Some(started.elapsed().as_millis() as u64),
            None,
        );
    }
}
