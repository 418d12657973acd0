// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-runtime.

use thiserror::Error;

/// Local runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Launcher (process execution) failed.
    #[error("Launcher error: {0}")]
    Launcher(#[from] crate::launcher::LauncherError),

    /// The function has no artifact and building one failed.
    #[error("Function {function_id} failed to build: {}", errors.join("; "))]
    BuildFailed {
        function_id: String,
        errors: Vec<String>,
    },

    /// Worker was not found.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
}

/// Result type using runtime Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_failed_display() {
        let err = Error::BuildFailed {
            function_id: "fn-api".to_string(),
            errors: vec!["missing export".to_string(), "bad import".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Function fn-api failed to build: missing export; bad import"
        );
    }
}
