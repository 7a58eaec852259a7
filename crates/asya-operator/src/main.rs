#![deny(unsafe_code)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use asya_operator::queues::TransportProvisioner;
use asya_operator::reconciler::{self, Context, OperatorSettings};
use asya_operator::scripts::{RuntimeScript, ScriptSource};

#[derive(Parser, Debug)]
#[command(name = "asya-operator", version, about = "Asya control-plane reconciler")]
struct Args {
    /// Local path to the canonical runtime script.
    #[arg(long, env = "ASYA_RUNTIME_SCRIPT_PATH")]
    script_path: Option<PathBuf>,

    /// Release artifact URL for the runtime script (used when no path is
    /// given).
    #[arg(long, env = "ASYA_RUNTIME_SCRIPT_URL")]
    script_url: Option<String>,

    /// Default image for injected sidecar containers.
    #[arg(long, default_value = asya_operator::inject::DEFAULT_SIDECAR_IMAGE)]
    sidecar_image: String,

    /// AMQP broker URL; enables AMQP queue provisioning.
    #[arg(long, env = "ASYA_AMQP_URL")]
    amqp_url: Option<String>,

    /// Enable SQS queue provisioning from the ambient AWS environment.
    #[arg(long)]
    enable_sqs: bool,

    /// Base URL used to resolve SQS queue URLs for autoscaler triggers.
    #[arg(long, env = "ASYA_SQS_BASE_URL")]
    sqs_base_url: Option<String>,

    /// Tracker base URL injected into sidecars.
    #[arg(long, env = "ASYA_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Default visibility timeout for provisioned queues, in seconds.
    #[arg(long, default_value_t = asya_config::DEFAULT_TIMEOUT_SECS)]
    visibility_timeout: u64,

    /// Bind address for health endpoints.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asya=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let source = match (&args.script_path, &args.script_url) {
        (Some(path), _) => ScriptSource::Path(path.clone()),
        (None, Some(url)) => ScriptSource::Url(url.clone()),
        (None, None) => anyhow::bail!("one of --script-path or --script-url is required"),
    };
    let script = RuntimeScript::load(&source)
        .await
        .context("load runtime script")?;

    let client = Client::try_default().await.context("build kube client")?;
    let queues = TransportProvisioner::connect(
        args.amqp_url.as_deref(),
        args.enable_sqs,
        Duration::from_secs(args.visibility_timeout),
    )
    .await
    .context("connect queue transports")?;

    let ctx = Arc::new(Context::new(
        client,
        Arc::new(queues),
        OperatorSettings {
            sidecar_image: args.sidecar_image,
            gateway_url: args.gateway_url,
            sqs_base_url: args.sqs_base_url,
        },
        script,
    ));

    // Health endpoints for the operator's own probes.
    let health = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(&args.health_bind)
        .await
        .with_context(|| format!("bind {}", args.health_bind))?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, health).await;
    });

    info!(target: "asya.operator", "controller starting");
    reconciler::run(ctx).await;
    Ok(())
}
