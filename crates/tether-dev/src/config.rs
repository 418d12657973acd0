// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dev session configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Dev session configuration
#[derive(Debug, Clone)]
pub struct DevConfig {
    /// Relay to register with
    pub relay_addr: SocketAddr,
    /// Accept the relay's self-signed certificate
    pub relay_insecure: bool,
    /// Port of the local Runtime-API emulator, 0 for any
    pub runtime_port: u16,
    /// Toolchain manifest
    pub manifest: PathBuf,
    /// Blob store shared with the relay's stubs. Without one, large
    /// payloads travel inline as fragments.
    pub blob_dir: Option<PathBuf>,
    /// Idle time after which a worker is stopped
    pub worker_idle: Duration,
    /// Enabled check names; empty enables every check in the manifest
    pub checks: Vec<String>,
}

impl DevConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TETHER_RELAY_ADDR`: relay address (default: 127.0.0.1:8710)
    /// - `TETHER_RELAY_INSECURE`: skip relay certificate verification (default: true)
    /// - `TETHER_RUNTIME_PORT`: Runtime-API emulator port (default: 12557)
    /// - `TETHER_MANIFEST`: toolchain manifest path (default: tether.json)
    /// - `TETHER_BLOB_DIR`: pointer blob store shared with the stubs (default: none)
    /// - `TETHER_WORKER_IDLE_SECS`: worker idle timeout (default: 900)
    /// - `TETHER_CHECKS`: comma separated check names (default: all)
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay_addr: SocketAddr = std::env::var("TETHER_RELAY_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8710".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TETHER_RELAY_ADDR", "must be host:port"))?;

        let relay_insecure = match std::env::var("TETHER_RELAY_INSECURE") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid("TETHER_RELAY_INSECURE", "must be true or false"))?,
            Err(_) => true,
        };

        let runtime_port: u16 = std::env::var("TETHER_RUNTIME_PORT")
            .unwrap_or_else(|_| "12557".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TETHER_RUNTIME_PORT", "must be a valid port number"))?;

        let manifest = std::env::var("TETHER_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tether.json"));

        let blob_dir = std::env::var("TETHER_BLOB_DIR")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let idle_secs: u64 = std::env::var("TETHER_WORKER_IDLE_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TETHER_WORKER_IDLE_SECS", "must be a number of seconds"))?;
        if idle_secs == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_WORKER_IDLE_SECS",
                "must be greater than zero",
            ));
        }

        let checks = std::env::var("TETHER_CHECKS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            relay_addr,
            relay_insecure,
            runtime_port,
            manifest,
            blob_dir,
            worker_idle: Duration::from_secs(idle_secs),
            checks,
        })
    }

    /// Whether a named check is enabled.
    pub fn check_enabled(&self, name: &str) -> bool {
        self.checks.is_empty() || self.checks.iter().any(|c| c == name)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
