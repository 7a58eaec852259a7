// SPDX-License-Identifier: MIT OR Apache-2.0
//! The supervisor: accept one connection, run one request, answer, repeat.

use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use asya_config::{readiness_marker, HandlerMode, RuntimeConfig};
use asya_model::Envelope;
use asya_wire::{read_frame, write_frame, ErrorResponse, WireResponse};

use crate::handler::{EnvelopeResult, Handler, HandlerError, HandlerRegistry, HandlerResult};
use crate::oom::{classify, CleanupHooks};
use crate::RuntimeError;

/// One-request-at-a-time socket server around a resolved handler.
///
/// Concurrency lives between pods, not here: the sidecar's prefetch governs
/// throughput, and a single in-flight request keeps handler state simple.
pub struct Supervisor {
    config: RuntimeConfig,
    handler: Arc<dyn Handler>,
    hooks: CleanupHooks,
}

impl Supervisor {
    /// Resolve the configured handler from `registry`. Fails fast when the
    /// locator is malformed or unregistered; the orchestrator restarts us.
    pub fn new(config: RuntimeConfig, registry: &HandlerRegistry) -> Result<Self, RuntimeError> {
        let handler = registry.resolve(&config.handler).inspect_err(|_| {
            error!(
                target: "asya.runtime",
                locator = %config.handler,
                registered = ?registry.locators(),
                "handler resolution failed"
            );
        })?;
        Ok(Self {
            config,
            handler,
            hooks: CleanupHooks::default(),
        })
    }

    /// Install cleanup hooks for OOM recovery.
    pub fn with_hooks(mut self, hooks: CleanupHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Bind the socket, write the readiness marker, and serve forever.
    pub async fn serve(&self) -> Result<(), RuntimeError> {
        let listener = self.bind().await?;

        // Handler resolved and socket listening: this is the readiness
        // contract the sidecar and the injected probe wait on.
        let marker = readiness_marker(&self.config.socket_path);
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(RuntimeError::Marker)?;
        info!(
            target: "asya.runtime",
            socket = %self.config.socket_path.display(),
            handler = %self.config.handler,
            "supervisor ready"
        );

        loop {
            match listener.accept().await {
                Ok((stream, _)) => self.handle_connection(stream).await,
                Err(e) => {
                    warn!(target: "asya.runtime", error = %e, "accept failed");
                }
            }
        }
    }

    async fn bind(&self) -> Result<UnixListener, RuntimeError> {
        let path = &self.config.socket_path;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(RuntimeError::Socket)?;
        }
        // A stale socket from a previous incarnation blocks bind.
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RuntimeError::Socket(e)),
        }
        let listener = UnixListener::bind(path).map_err(RuntimeError::Socket)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(
                path,
                std::fs::Permissions::from_mode(self.config.socket_chmod),
            )
            .await
            .map_err(RuntimeError::Socket)?;
        }
        Ok(listener)
    }

    /// Read one framed request, execute, write one framed response.
    ///
    /// The sidecar closing the connection (its deadline elapsed) surfaces
    /// here as a read or write error; the in-flight work is discarded.
    async fn handle_connection(&self, mut stream: UnixStream) {
        let request = match read_frame(&mut stream).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(target: "asya.runtime", error = %e, "request read failed, dropping connection");
                return;
            }
        };

        let response = match serde_json::from_slice::<Envelope>(&request) {
            Ok(envelope) => self.execute(envelope).await,
            Err(e) => WireResponse::Error(ErrorResponse::from_code(
                asya_model::ErrorCode::InvalidJson,
                format!("request is not a valid envelope: {e}"),
            )),
        };

        let bytes = match response.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(target: "asya.runtime", error = %e, "response serialization failed");
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &bytes).await {
            // Most likely the sidecar gave up on its deadline.
            debug!(target: "asya.runtime", error = %e, "response write failed");
        }
    }

    async fn execute(&self, envelope: Envelope) -> WireResponse {
        // Soft warning only: the sidecar owns the hard deadline and will
        // close the socket when it elapses.
        let soft = self.config.processing_timeout;
        let envelope_id = envelope.id.clone();
        let warn_timer = tokio::spawn(async move {
            tokio::time::sleep(soft).await;
            warn!(
                target: "asya.runtime",
                envelope = %envelope_id,
                timeout_secs = soft.as_secs(),
                "handler still running past the processing deadline"
            );
        });

        let response = match self.config.handler_mode {
            HandlerMode::Payload => self.execute_payload(&envelope).await,
            HandlerMode::Envelope => self.execute_envelope(&envelope).await,
        };

        warn_timer.abort();
        response
    }

    async fn execute_payload(&self, envelope: &Envelope) -> WireResponse {
        match self.handler.call(envelope.payload.clone()).await {
            Ok(HandlerResult::None) => WireResponse::NoContinuation,
            Ok(HandlerResult::One(value)) => {
                WireResponse::Results(envelope.fan_out(vec![value]))
            }
            Ok(HandlerResult::Many(values)) if values.is_empty() => WireResponse::NoContinuation,
            Ok(HandlerResult::Many(values)) => WireResponse::Results(envelope.fan_out(values)),
            Err(err) => self.error_response(err),
        }
    }

    async fn execute_envelope(&self, envelope: &Envelope) -> WireResponse {
        let returned = match self.handler.call_envelope(envelope.clone()).await {
            Ok(EnvelopeResult::None) => return WireResponse::NoContinuation,
            Ok(EnvelopeResult::One(out)) => vec![out],
            Ok(EnvelopeResult::Many(outs)) if outs.is_empty() => {
                return WireResponse::NoContinuation
            }
            Ok(EnvelopeResult::Many(outs)) => outs,
            Err(err) => return self.error_response(err),
        };

        for out in &returned {
            if let Err(e) = out.route.validate() {
                return WireResponse::Error(ErrorResponse::from_code(
                    asya_model::ErrorCode::ProcessingError,
                    format!("handler returned an invalid route: {e}"),
                ));
            }
            if envelope.route.prefix_preserved(&out.route).is_err() {
                return WireResponse::Error(ErrorResponse::from_code(
                    asya_model::ErrorCode::ProcessingError,
                    "handler altered the processed prefix of route.actors",
                ));
            }
        }
        WireResponse::Results(returned)
    }

    fn error_response(&self, err: HandlerError) -> WireResponse {
        let code = classify(&err, self.config.enable_oom_detection);
        self.hooks.run(code, self.config.cuda_cleanup_on_oom);

        let (class, message) = match err {
            HandlerError::Oom(message) => ("MemoryError".to_string(), message),
            HandlerError::CudaOom(message) => ("OutOfMemoryError".to_string(), message),
            HandlerError::Failure { class, message } => (class, message),
        };
        warn!(target: "asya.runtime", code = %code, class = %class, "handler failed");
        WireResponse::Error(ErrorResponse::from_code(code, message).with_class(class))
    }
}
