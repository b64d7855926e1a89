//! carshare-relay: terminal command relay binary

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use carshare_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting carshare-relay");

    // Load configuration
    let config = RelayConfig::load()?;

    // Open the booking database and bind the listener
    let server = RelayServer::new(config).await?;

    // Run server
    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
