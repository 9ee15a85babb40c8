//! Roamie Server
//!
//! Loads the drop catalog, opens the user store and serves WebSocket
//! clients until Ctrl-C.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use roamie::{
    VERSION,
    collect::drop::DropCatalog,
    network::{AuthConfig, RoamieServer, ServerConfig},
    store::{StoreConfig, UserStore},
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_LOG_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Roamie Server v{}", VERSION);

    let catalog = match std::env::var("ROAMIE_CATALOG") {
        Ok(path) => DropCatalog::from_json_file(&path)
            .with_context(|| format!("Failed to load drop catalog from {}", path))?,
        Err(_) => DropCatalog::builtin(),
    };
    info!("Drop catalog: {} items", catalog.len());

    let store_config = StoreConfig::from_env();
    let store = UserStore::open(store_config.backend())
        .context("Failed to open user store")?;

    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("AUTH_* not set; token login disabled, username login only");
    }

    let server = Arc::new(RoamieServer::new(
        ServerConfig::from_env(),
        auth,
        Arc::new(store),
        Arc::new(catalog),
    ));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("Server failed")?;

    info!("Roamie server stopped");
    Ok(())
}
