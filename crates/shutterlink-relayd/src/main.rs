use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    // Usar RUST_LOG=debug para mais detalhes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("ShutterLink relayd v{}", env!("CARGO_PKG_VERSION"));

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{}", shutterlink_relay::tcp::RELAY_PORT));

    match server::RelayServer::bind(&bind).await {
        Ok(server) => {
            server.run().await;
            info!("relayd exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
