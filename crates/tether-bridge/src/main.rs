// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Relay
//!
//! Hosts the bridge relay over QUIC with a self-signed certificate. Stubs
//! and the local dev session connect here.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use tether_bridge::config::RelayConfig;
use tether_bridge::{Relay, RelayServer};
use tether_protocol::{CodecConfig, TetherServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_relay=info,tether_bridge=info".into()),
        )
        .init();

    info!("Starting Tether relay");

    let config = RelayConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        relay_addr = %config.relay_addr,
        idle_timeout_ms = config.quic.idle_timeout_ms,
        "Configuration loaded"
    );

    let server = TetherServer::localhost_with_config(config.relay_addr, config.quic.clone())?;
    let relay = Arc::new(Relay::new());
    let server = Arc::new(RelayServer::new(server, relay, CodecConfig::default()));
    info!(addr = %server.local_addr()?, "Relay listening");

    let running = server.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = running.run().await {
            error!("Relay server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    server.close();
    let _ = server_handle.await;
    info!("Shutdown complete");

    Ok(())
}
