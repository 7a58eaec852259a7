#![deny(unsafe_code)]
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use asya_config::SidecarConfig;
use asya_sidecar::{MessagePump, ProgressReporter, Router, RouterOptions, RuntimeClient, ShutdownToken};
use asya_transport::{naming, AmqpTransport, MemoryTransport, QueueAdmin, SqsTransport, Transport, TransportKind};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asya=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SidecarConfig::from_env().context("read sidecar configuration")?;
    let kind: TransportKind = config
        .transport
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    info!(
        target: "asya.sidecar",
        actor = %config.actor_name,
        transport = %kind,
        terminal = config.is_terminal,
        "starting sidecar"
    );

    let transport = build_transport(&config, kind).await?;

    let queue = config
        .queue_name
        .clone()
        .unwrap_or_else(|| naming::resolve(kind, &config.actor_name, config.sqs_base_url.as_deref()));

    let shutdown = ShutdownToken::new();
    shutdown.listen_for_signals();

    let reporter = config.gateway_url.as_deref().map(ProgressReporter::new);
    let router = Router::new(
        RouterOptions {
            actor: config.actor_name.clone(),
            transport_kind: kind,
            base_url: config.sqs_base_url.clone(),
            terminal: config.is_terminal,
            graceful_shutdown: config.graceful_shutdown,
        },
        transport.clone(),
        RuntimeClient::new(&config.socket_path, config.processing_timeout),
        reporter,
        shutdown.clone(),
    );

    let pump = MessagePump::new(router, transport.clone(), queue, shutdown);
    pump.run().await.context("message pump")?;

    transport.close().await.ok();
    Ok(())
}

/// Connect the configured transport and make sure this actor's queue
/// exists before consuming from it.
async fn build_transport(
    config: &SidecarConfig,
    kind: TransportKind,
) -> Result<Arc<dyn Transport>> {
    Ok(match kind {
        TransportKind::Amqp => {
            let url = config
                .amqp_url
                .clone()
                .unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".to_string());
            let transport = AmqpTransport::connect(&url, config.prefetch)
                .await
                .context("connect amqp broker")?;
            transport
                .ensure(&config.actor_name)
                .await
                .context("declare actor queue")?;
            Arc::new(transport)
        }
        TransportKind::Sqs => {
            let transport = SqsTransport::from_env(config.processing_timeout).await;
            transport
                .ensure(&config.actor_name)
                .await
                .context("create actor queue")?;
            Arc::new(transport)
        }
        TransportKind::Memory => Arc::new(MemoryTransport::new()),
    })
}
