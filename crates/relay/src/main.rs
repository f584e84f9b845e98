//! Signaling relay entry point.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use beamdrop_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::var("BEAMDROP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port,
        "starting beamdrop relay"
    );

    let server = RelayServer::new(RelayConfig { port });
    let runner = Arc::clone(&server);
    let run = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    server.shutdown();
    run.await??;
    Ok(())
}
