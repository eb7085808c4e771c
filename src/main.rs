//! Avatar Relay Server
//!
//! Binary entry point: loads credentials, binds the WebSocket listener,
//! and runs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use avatar_relay::{
    MemoryCredentialStore, MemorySubscriptionStore, RelayServer, ServerConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Avatar Relay Server v{}", VERSION);
    info!("Bind: {}", config.bind_addr);
    info!(
        "Quota defaults: {} pings/s, {} bytes/s",
        config.default_quota.ping_rate, config.default_quota.ping_size
    );

    let credentials = match std::env::var("RELAY_CREDENTIALS") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading credential file {path}"))?;
            let store = MemoryCredentialStore::from_json(&raw)
                .with_context(|| format!("parsing credential file {path}"))?;
            info!("Loaded {} tokens from {}", store.token_count(), path);
            store
        }
        Err(_) => {
            warn!("RELAY_CREDENTIALS not set; starting with an empty credential store");
            MemoryCredentialStore::new(config.default_quota)
        }
    };

    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let server = Arc::new(RelayServer::new(
        config,
        Arc::new(credentials),
        subscriptions,
    ));

    // Ctrl-C triggers a graceful shutdown.
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown_server.shutdown();
        }
    });

    server.run().await?;
    info!("Goodbye");
    Ok(())
}
