// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Records launches and stops without spawning processes. Tests play the
//! worker themselves through the Runtime API and can simulate exits and
//! output lines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::traits::*;

struct MockWorker {
    options: LaunchOptions,
    exit: Option<oneshot::Sender<WorkerExit>>,
    logs: mpsc::UnboundedSender<String>,
    running: bool,
}

/// Mock launcher for testing.
pub struct MockLauncher {
    workers: Arc<Mutex<HashMap<String, MockWorker>>>,
    order: Arc<Mutex<Vec<String>>>,
    /// If true, every launch fails
    pub fail_launch: bool,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    /// Create a new mock launcher.
    pub fn new() -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            order: Arc::new(Mutex::new(Vec::new())),
            fail_launch: false,
        }
    }

    /// Create a mock launcher whose launches always fail.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new()
        }
    }

    /// Worker ids in launch order.
    pub async fn launched(&self) -> Vec<String> {
        self.order.lock().await.clone()
    }

    /// Options a worker was launched with.
    pub async fn options(&self, worker_id: &str) -> Option<LaunchOptions> {
        self.workers
            .lock()
            .await
            .get(worker_id)
            .map(|w| w.options.clone())
    }

    pub async fn is_running(&self, worker_id: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(worker_id)
            .is_some_and(|w| w.running)
    }

    /// Simulate the worker process exiting on its own.
    pub async fn exit_worker(&self, worker_id: &str, code: Option<i32>) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.running = false;
            if let Some(exit) = worker.exit.take() {
                let _ = exit.send(WorkerExit { code });
            }
        }
    }

    /// Simulate an output line from the worker.
    pub async fn emit_log(&self, worker_id: &str, line: &str) {
        if let Some(worker) = self.workers.lock().await.get(worker_id) {
            let _ = worker.logs.send(line.to_string());
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Launched> {
        if self.fail_launch {
            return Err(LauncherError::StartFailed("Mock failure".to_string()));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            worker_id: options.worker_id.clone(),
            function_id: options.function_id.clone(),
            started_at: Utc::now(),
            pid: None, // Mock doesn't spawn real processes
        };

        self.workers.lock().await.insert(
            options.worker_id.clone(),
            MockWorker {
                options: options.clone(),
                exit: Some(exit_tx),
                logs: logs_tx,
                running: true,
            },
        );
        self.order.lock().await.push(options.worker_id.clone());

        Ok(Launched {
            handle,
            exit: exit_rx,
            logs: logs_rx,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get_mut(&handle.worker_id) {
            worker.running = false;
            // Stopped workers report no exit
            worker.exit.take();
        }
        Ok(())
    }
}
