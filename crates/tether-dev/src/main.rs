// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Dev
//!
//! Registers with the relay and serves relayed invocations with local
//! workers. Type `deploy` to deploy the pending stack assembly and
//! `status` to list running workers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use tether_bridge::{ClientExit, QuicConnector};
use tether_builder::LifecycleEvent;
use tether_dev::{CommandToolchain, DevConfig, DevRuntime, Manifest};
use tether_protocol::{FsBlobStore, TetherClientConfig};
use tether_runtime::ProcessLauncher;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tether_dev=info,tether_runtime=info,tether_builder=info,tether_bridge=info".into()
            }),
        )
        .init();

    info!("Starting Tether dev session");

    let config = DevConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let manifest = Manifest::load(&config.manifest).await.map_err(|e| {
        error!("Manifest error: {}", e);
        e
    })?;
    let root = manifest_root(&config.manifest);

    info!(
        relay_addr = %config.relay_addr,
        runtime_port = config.runtime_port,
        manifest = %config.manifest.display(),
        functions = manifest.functions.len(),
        stack = manifest.stack.is_some(),
        "Configuration loaded"
    );

    let toolchain = Arc::new(CommandToolchain::new(root.clone(), manifest));

    let mut connector = QuicConnector::new(TetherClientConfig {
        server_addr: config.relay_addr,
        dangerous_skip_cert_verification: config.relay_insecure,
        ..Default::default()
    });
    match &config.blob_dir {
        Some(dir) => {
            info!(blob_dir = %dir.display(), "Large payloads go through the shared blob store");
            connector = connector.with_store(Arc::new(FsBlobStore::new(dir.clone())));
        }
        None => info!("No shared blob store, large payloads travel inline"),
    }

    let mut builder = DevRuntime::builder()
        .connector(Arc::new(connector))
        .launcher(Arc::new(ProcessLauncher::new()))
        .function_toolchain(toolchain.clone())
        .runtime_addr(SocketAddr::from(([127, 0, 0, 1], config.runtime_port)))
        .worker_idle(config.worker_idle)
        .watch_root(root);
    for spec in toolchain.function_specs(|name| config.check_enabled(name))? {
        let command = toolchain.worker_command(&spec.id).unwrap_or_default();
        builder = builder.function(spec, command);
    }
    if toolchain.has_stack() {
        builder = builder.stack_toolchain(toolchain.clone());
    }

    let runtime = builder.build()?.start().await?;
    info!(runtime_addr = %runtime.runtime_addr(), "Dev session ready");

    let reporter = tokio::spawn(report(runtime.subscribe()));
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut client_exit = runtime.client_exit();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            exit = client_exit.wait_for(Option::is_some) => {
                if let Ok(exit) = exit
                    && *exit == Some(ClientExit::Superseded)
                {
                    warn!("Another dev session took over the relay, exiting");
                }
                break;
            }
            line = commands.next_line() => match line {
                Ok(Some(line)) => command(&runtime, line.trim()),
                Ok(None) => {
                    // stdin closed; keep serving until interrupted
                    tokio::signal::ctrl_c().await?;
                    info!("Shutting down...");
                    break;
                }
                Err(e) => warn!(error = %e, "Cannot read stdin"),
            },
        }
    }

    reporter.abort();
    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

fn manifest_root(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn command(runtime: &DevRuntime, line: &str) {
    match line {
        "" => {}
        "deploy" => {
            if !runtime.deploy() {
                warn!("No stack in manifest");
            }
        }
        "status" => {
            let workers = runtime.supervisor().workers();
            info!(count = workers.len(), "Workers");
            for worker in workers {
                info!(
                    function_id = %worker.function_id,
                    worker_id = %worker.worker_id,
                    busy = worker.busy,
                    served = worker.served,
                    "Worker"
                );
            }
            if let Some(stack) = runtime.stack() {
                info!(state = ?stack.snapshot().state, "Stack");
            }
        }
        other => warn!(command = other, "Unknown command, expected deploy or status"),
    }
}

async fn report(mut events: tokio::sync::broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match &event {
                LifecycleEvent::FunctionBuildFailed { function_id, errors } => {
                    error!(function_id = %function_id, "Build failed:\n{}", errors.join("\n"));
                }
                LifecycleEvent::FunctionChecked { function_id, issues }
                    if issues.values().any(|found| !found.is_empty()) =>
                {
                    for (check, found) in issues {
                        for issue in found {
                            warn!(function_id = %function_id, check = %check, "{}", issue.message);
                        }
                    }
                }
                LifecycleEvent::FunctionLog { function_id, line, .. } => {
                    info!(function_id = %function_id, "{}", line);
                }
                LifecycleEvent::StackBuildFailed { errors }
                | LifecycleEvent::StackSynthFailed { errors } => {
                    error!("Stack failed:\n{}", errors.join("\n"));
                }
                LifecycleEvent::StackDeployFailed { errors, .. } => {
                    error!("Deploy failed:\n{}", errors.join("\n"));
                }
                LifecycleEvent::StackSynthSuccess { checksum } => {
                    info!(checksum = %checksum, "Stack changed, type `deploy` to deploy it");
                }
                _ => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = event.name(), "{}", json),
                    Err(_) => info!(event = event.name(), "Lifecycle event"),
                },
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Lifecycle events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
