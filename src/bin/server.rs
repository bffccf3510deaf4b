//! Gateway server binary.
//!
//! Loads the TOML configuration (first CLI argument, optional), installs
//! tracing, and serves until Ctrl-C.

use tokio_util::sync::CancellationToken;
use voxgate::{GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxgate=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(std::path::Path::new(&path))?,
        None => GatewayConfig::default(),
    };

    let server = GatewayServer::bind(config).await?;
    tracing::info!("voxgate listening on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrlc_shutdown.cancel();
        }
    });

    server.run(shutdown).await?;
    tracing::info!("voxgate shut down cleanly");
    Ok(())
}
