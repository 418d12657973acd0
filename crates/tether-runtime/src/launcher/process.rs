// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process launcher.
//!
//! Runs the artifact's command as a child process with the Runtime-API
//! variables in its environment. Output is forwarded line by line; stop
//! sends SIGTERM and escalates to SIGKILL after a grace period.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::traits::*;

/// Launches workers as local OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

fn forward_lines<R>(reader: R, worker_id: String, logs: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id = %worker_id, "{}", line);
            if logs.send(line).is_err() {
                break;
            }
        }
    });
}

fn send_signal(pid: u32, signal: Signal) -> std::result::Result<bool, nix::errno::Errno> {
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Launched> {
        let Some((program, args)) = options.artifact.command.split_first() else {
            return Err(LauncherError::EmptyCommand(options.function_id.clone()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&options.artifact.path)
            .envs(options.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LauncherError::StartFailed(format!("{program}: {e}")))?;
        let pid = child.id();

        info!(
            worker_id = %options.worker_id,
            function_id = %options.function_id,
            pid = ?pid,
            "Worker started"
        );

        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, options.worker_id.clone(), logs_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, options.worker_id.clone(), logs_tx);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let worker_id = options.worker_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to wait for worker");
                    None
                }
            };
            debug!(worker_id = %worker_id, code = ?code, "Worker exited");
            let _ = exit_tx.send(WorkerExit { code });
        });

        Ok(Launched {
            handle: WorkerHandle {
                worker_id: options.worker_id.clone(),
                function_id: options.function_id.clone(),
                started_at: Utc::now(),
                pid,
            },
            exit: exit_rx,
            logs: logs_rx,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };

        let delivered = send_signal(pid, Signal::SIGTERM).map_err(|e| LauncherError::Signal {
            worker_id: handle.worker_id.clone(),
            message: e.to_string(),
        })?;
        if !delivered {
            debug!(worker_id = %handle.worker_id, pid, "Worker already gone");
            return Ok(());
        }
        debug!(worker_id = %handle.worker_id, pid, "Sent SIGTERM to worker");

        let grace = self.stop_grace;
        let worker_id = handle.worker_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match send_signal(pid, Signal::SIGKILL) {
                Ok(true) => warn!(worker_id = %worker_id, pid, "Worker ignored SIGTERM, killed"),
                Ok(false) => {}
                Err(e) => warn!(worker_id = %worker_id, pid, error = %e, "Failed to kill worker"),
            }
        });
        Ok(())
    }
}
