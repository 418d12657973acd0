// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay configuration loading from environment variables.

use std::net::SocketAddr;

use tether_protocol::TetherServerConfig;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// QUIC address stubs and clients connect to
    pub relay_addr: SocketAddr,
    /// QUIC transport limits
    pub quic: TetherServerConfig,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TETHER_RELAY_PORT`: QUIC server port (default: 8710)
    /// - `TETHER_QUIC_*`: transport limits, see [`TetherServerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("TETHER_RELAY_PORT")
            .unwrap_or_else(|_| "8710".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TETHER_RELAY_PORT", "must be a valid port number"))?;

        let relay_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let quic = TetherServerConfig {
            bind_addr: relay_addr,
            ..TetherServerConfig::from_env()
        };

        Ok(Self { relay_addr, quic })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
