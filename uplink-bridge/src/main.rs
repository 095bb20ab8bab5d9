//! # Uplink Bridge Service
//!
//! HTTP front end for the bridge pipeline.
//!
//! ## Running
//!
//! ```bash
//! export UPLINK_ID_SCOPE=0ne000A1B2C
//! export UPLINK_SAS_TOKEN=<base64 group enrollment key>
//! export UPLINK_CLIENT_CONNECTION_STRING="HostName=...;SharedAccessKeyName=...;SharedAccessKey=..."
//!
//! cargo run --release --bin uplink-bridge
//! ```
//!
//! ## API Endpoints
//!
//! - `POST /api/v1/uplink` - Bridge one inbound device message
//! - `GET /health` - Health check
//! - `GET /metrics` - Cache and request counters

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shared::config::BridgeConfig;
use uplink_bridge::{api, bridge::Bridge, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Uplink Bridge");
    info!("Version: {}", shared::VERSION);

    // Load configuration
    let config = BridgeConfig::from_env()?;
    config.validate()?;

    info!(
        id_scope = %config.id_scope,
        registration_host = %config.provisioning.registration_host,
        signature_ttl_secs = config.signature.expiry_secs,
        strict_measurements = config.validation.strict_measurements,
        "Configuration loaded"
    );

    if config.service_connection.is_none() {
        warn!("No service connection configured; twin synchronization will fail");
    }

    let bridge = Bridge::from_config(&config)?;
    let state = Arc::new(AppState::new(config.clone(), bridge));

    let app = api::create_router(state);

    // Start server
    let bind_addr = config.api.bind_addr();
    info!(address = %bind_addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Server running at http://{}", bind_addr);
    info!("  POST /api/v1/uplink - Bridge one device message");
    info!("  DELETE /api/v1/admin/cache/:device_id - Evict a cached device");

    axum::serve(listener, app).await?;

    Ok(())
}
