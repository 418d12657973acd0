// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-builder.

use std::path::PathBuf;

use thiserror::Error;

/// Build orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cloud assembly is missing or malformed.
    #[error("Invalid assembly at {path}: {message}")]
    InvalidAssembly { path: PathBuf, message: String },

    /// Watch pattern could not be compiled.
    #[error("Invalid watch pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// File watcher could not be started.
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Function is not registered with the builder set.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// The build actor has stopped.
    #[error("Builder for {0} has stopped")]
    Stopped(String),
}

/// Result type using builder Error.
pub type Result<T> = std::result::Result<T, Error>;
