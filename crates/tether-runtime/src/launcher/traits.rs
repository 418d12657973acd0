// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.
//!
//! Defines the abstract interface for starting and stopping workers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LauncherError {
    /// The artifact has no command to run.
    #[error("Empty worker command for function {0}")]
    EmptyCommand(String),

    /// Process failed to start.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// Sending a signal to the worker failed.
    #[error("Failed to signal worker {worker_id}: {message}")]
    Signal { worker_id: String, message: String },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, LauncherError>;

/// A built function, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Directory the worker runs in
    pub path: PathBuf,
    /// Handler entry point, exposed to the worker as `_HANDLER`
    pub handler: String,
    /// Worker command line; the first element is the program
    pub command: Vec<String>,
}

/// Options for launching a worker.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Worker ID, also the Runtime-API path prefix
    pub worker_id: String,
    /// Function the worker serves
    pub function_id: String,
    /// What to run
    pub artifact: Artifact,
    /// Value for `AWS_LAMBDA_RUNTIME_API` (`host:port/worker_id`)
    pub runtime_api: String,
    /// Forwarded environment, applied before the runtime variables
    pub env: BTreeMap<String, String>,
}

impl LaunchOptions {
    /// Complete worker environment: forwarded variables first, then the
    /// runtime variables, which win on conflict.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("AWS_LAMBDA_RUNTIME_API".to_string(), self.runtime_api.clone());
        env.insert("_HANDLER".to_string(), self.artifact.handler.clone());
        env.insert(
            "LAMBDA_TASK_ROOT".to_string(),
            self.artifact.path.display().to_string(),
        );
        env.entry("AWS_LAMBDA_FUNCTION_NAME".to_string())
            .or_insert_with(|| self.function_id.clone());
        env
    }
}

/// Handle for a launched worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub function_id: String,
    /// When the worker was started
    pub started_at: DateTime<Utc>,
    /// PID of the spawned process, if the launcher runs real processes
    pub pid: Option<u32>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
}

/// A running worker plus its exit and output channels.
pub struct Launched {
    pub handle: WorkerHandle,
    /// Resolves once the process exits
    pub exit: oneshot::Receiver<WorkerExit>,
    /// Output lines from the worker
    pub logs: mpsc::UnboundedReceiver<String>,
}

/// Trait for worker launchers.
///
/// Launchers only start and stop processes. Dispatch, queuing and the
/// idle policy belong to the supervisor.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher type identifier (e.g. "process", "mock")
    fn launcher_type(&self) -> &'static str;

    /// Start a worker without waiting for it to finish.
    async fn launch(&self, options: &LaunchOptions) -> Result<Launched>;

    /// Stop a running worker.
    async fn stop(&self, handle: &WorkerHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_variables_override_forwarded_env() {
        let options = LaunchOptions {
            worker_id: "w1".to_string(),
            function_id: "fn-api".to_string(),
            artifact: Artifact {
                path: PathBuf::from("/app/.build/api"),
                handler: "index.handler".to_string(),
                command: vec!["node".to_string(), "bootstrap.mjs".to_string()],
            },
            runtime_api: "127.0.0.1:12557/w1".to_string(),
            env: BTreeMap::from([
                ("AWS_LAMBDA_RUNTIME_API".to_string(), "cloud".to_string()),
                ("AWS_LAMBDA_FUNCTION_NAME".to_string(), "prod-api".to_string()),
                ("TABLE_NAME".to_string(), "orders".to_string()),
            ]),
        };

        let env = options.environment();
        assert_eq!(env["AWS_LAMBDA_RUNTIME_API"], "127.0.0.1:12557/w1");
        assert_eq!(env["_HANDLER"], "index.handler");
        assert_eq!(env["LAMBDA_TASK_ROOT"], "/app/.build/api");
        assert_eq!(env["AWS_LAMBDA_FUNCTION_NAME"], "prod-api");
        assert_eq!(env["TABLE_NAME"], "orders");
    }
}
