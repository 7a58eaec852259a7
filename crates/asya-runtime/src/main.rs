#![deny(unsafe_code)]
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use asya_config::RuntimeConfig;
use asya_runtime::{builtins, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asya=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RuntimeConfig::from_env().context("read runtime configuration")?;
    info!(
        target: "asya.runtime",
        handler = %config.handler,
        mode = ?config.handler_mode,
        socket = %config.socket_path.display(),
        "starting runtime supervisor"
    );

    let registry = builtins::registry();
    let supervisor = Supervisor::new(config, &registry).context("resolve handler")?;
    supervisor.serve().await.context("serve")
}
