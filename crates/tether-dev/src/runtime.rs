// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable live development session.
//!
//! [`DevRuntime`] wires every local component together:
//!
//! - a [`BridgeClient`] registered with the relay, answering invocations
//! - the Runtime-API emulator and the worker [`Supervisor`]
//! - one [`FunctionBuilder`] per function and an optional [`StackBuilder`]
//! - an optional [`FileWatcher`] feeding both kinds of builder
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_dev::runtime::DevRuntime;
//!
//! let runtime = DevRuntime::builder()
//!     .connector(connector)
//!     .launcher(Arc::new(ProcessLauncher::new()))
//!     .function_toolchain(toolchain.clone())
//!     .function(spec, vec!["node".into(), "runtime.mjs".into()])
//!     .watch_root("/app")
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_bridge::{
    BridgeClient, BridgeClientConfig, ClientEvent, ClientExit, Connector, InvocationHandler,
};
use tether_builder::{
    BuildMode, BuilderSet, EventBus, FileChange, FileWatcher, FunctionBuilder, FunctionSpec,
    FunctionToolchain, LifecycleEvent, StackBuilder, StackToolchain,
};
use tether_protocol::{InvocationPayload, InvocationResult};
use tether_runtime::{
    Artifact, ArtifactProvider, Invocation, Launcher, RuntimeApi, Supervisor, SupervisorConfig,
    WorkerEvent,
};

/// Error type reported when the supervisor drops an invocation.
pub const UNAVAILABLE_TYPE: &str = "Runtime.Unavailable";

/// Builder for creating a [`DevRuntime`].
pub struct DevRuntimeBuilder {
    connector: Option<Arc<dyn Connector>>,
    launcher: Option<Arc<dyn Launcher>>,
    function_toolchain: Option<Arc<dyn FunctionToolchain>>,
    stack_toolchain: Option<Arc<dyn StackToolchain>>,
    functions: Vec<(FunctionSpec, Vec<String>)>,
    runtime_addr: SocketAddr,
    watch_root: Option<PathBuf>,
    build_mode: BuildMode,
    supervisor: SupervisorConfig,
    client: BridgeClientConfig,
}

impl Default for DevRuntimeBuilder {
    fn default() -> Self {
        Self {
            connector: None,
            launcher: None,
            function_toolchain: None,
            stack_toolchain: None,
            functions: Vec::new(),
            runtime_addr: SocketAddr::from(([127, 0, 0, 1], 12557)),
            watch_root: None,
            build_mode: BuildMode::Dev,
            supervisor: SupervisorConfig::default(),
            client: BridgeClientConfig::default(),
        }
    }
}

impl DevRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how the bridge client reaches the relay (required).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the worker launcher (required).
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the toolchain that builds and checks functions (required).
    pub fn function_toolchain(mut self, toolchain: Arc<dyn FunctionToolchain>) -> Self {
        self.function_toolchain = Some(toolchain);
        self
    }

    /// Enable the stack build/deploy machine.
    pub fn stack_toolchain(mut self, toolchain: Arc<dyn StackToolchain>) -> Self {
        self.stack_toolchain = Some(toolchain);
        self
    }

    /// Register a function and the command line its workers run.
    pub fn function(mut self, spec: FunctionSpec, worker_command: Vec<String>) -> Self {
        self.functions.push((spec, worker_command));
        self
    }

    /// Set the Runtime-API emulator address. Port 0 picks a free port.
    ///
    /// Default: `127.0.0.1:12557`
    pub fn runtime_addr(mut self, addr: SocketAddr) -> Self {
        self.runtime_addr = addr;
        self
    }

    /// Watch this directory for source changes.
    pub fn watch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.watch_root = Some(root.into());
        self
    }

    /// Set how long a worker may sit idle before it is stopped.
    ///
    /// Default: 15 minutes
    pub fn worker_idle(mut self, idle: Duration) -> Self {
        self.supervisor.idle_timeout = idle;
        self
    }

    /// Set the bridge client timing.
    pub fn client_config(mut self, config: BridgeClientConfig) -> Self {
        self.client = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<DevRuntimeConfig> {
        let connector = self
            .connector
            .ok_or_else(|| anyhow::anyhow!("connector is required"))?;
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow::anyhow!("launcher is required"))?;
        let function_toolchain = self
            .function_toolchain
            .ok_or_else(|| anyhow::anyhow!("function_toolchain is required"))?;

        Ok(DevRuntimeConfig {
            connector,
            launcher,
            function_toolchain,
            stack_toolchain: self.stack_toolchain,
            functions: self.functions,
            runtime_addr: self.runtime_addr,
            watch_root: self.watch_root,
            build_mode: self.build_mode,
            supervisor: self.supervisor,
            client: self.client,
        })
    }
}

/// Configuration for a [`DevRuntime`].
pub struct DevRuntimeConfig {
    connector: Arc<dyn Connector>,
    launcher: Arc<dyn Launcher>,
    function_toolchain: Arc<dyn FunctionToolchain>,
    stack_toolchain: Option<Arc<dyn StackToolchain>>,
    functions: Vec<(FunctionSpec, Vec<String>)>,
    runtime_addr: SocketAddr,
    watch_root: Option<PathBuf>,
    build_mode: BuildMode,
    supervisor: SupervisorConfig,
    client: BridgeClientConfig,
}

impl DevRuntimeConfig {
    /// Start the session: bind the Runtime API, spawn builders, the
    /// supervisor and the bridge client.
    pub async fn start(self) -> Result<DevRuntime> {
        let bus = EventBus::new();

        let mut builders = BuilderSet::new();
        let mut commands = HashMap::new();
        for (spec, command) in self.functions {
            commands.insert(spec.id.clone(), command);
            builders.insert(FunctionBuilder::spawn(
                spec,
                self.function_toolchain.clone(),
                bus.clone(),
                self.build_mode,
            ));
        }
        let stack = self
            .stack_toolchain
            .map(|toolchain| StackBuilder::spawn(toolchain, bus.clone()));

        // Runtime API
        let listener = TcpListener::bind(self.runtime_addr).await?;
        let runtime_addr = listener.local_addr()?;
        let (api, api_events) = RuntimeApi::new();
        let api_shutdown = Arc::new(Notify::new());
        let api_handle = tokio::spawn(api.clone().serve(listener, api_shutdown.clone()));

        // Supervisor
        let artifacts = Arc::new(BuilderArtifacts {
            builders: builders.clone(),
            commands,
        });
        let supervisor = Supervisor::new(
            api,
            api_events,
            self.launcher,
            artifacts,
            runtime_addr,
            self.supervisor,
        );
        let supervisor_shutdown = supervisor.shutdown_handle();
        let supervisor_handle = tokio::spawn(supervisor.clone().run());

        let mut tasks = vec![tokio::spawn(forward_worker_events(
            supervisor.subscribe(),
            bus.clone(),
        ))];
        for function_id in builders.ids() {
            let builder = builders.get(function_id)?.clone();
            tasks.push(tokio::spawn(invalidate_on_rebuild(
                builder,
                supervisor.clone(),
            )));
        }

        // Source watcher
        let watcher = match &self.watch_root {
            Some(root) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let watcher = FileWatcher::start(root, tx)?;
                tasks.push(tokio::spawn(route_changes(
                    rx,
                    builders.clone(),
                    stack.clone(),
                )));
                Some(watcher)
            }
            None => None,
        };

        // Bridge client
        let handler = Arc::new(SessionHandler {
            supervisor: supervisor.clone(),
            builders: builders.clone(),
        });
        let client = BridgeClient::new(self.connector, handler, self.client);
        let client_events = client.subscribe();
        let client_shutdown = client.shutdown_handle();
        let (client_exit_tx, client_exit) = watch::channel(None);
        let client_handle = tokio::spawn(async move {
            let exit = client.run().await;
            client_exit_tx.send_replace(Some(exit));
        });

        info!(
            runtime_addr = %runtime_addr,
            functions = builders.ids().count(),
            stack = stack.is_some(),
            watching = self.watch_root.is_some(),
            "DevRuntime started"
        );

        Ok(DevRuntime {
            runtime_addr,
            bus,
            builders,
            stack,
            supervisor,
            client_events,
            client_exit,
            client_shutdown,
            client_handle,
            supervisor_shutdown,
            supervisor_handle,
            api_shutdown,
            api_handle,
            tasks,
            _watcher: watcher,
        })
    }
}

/// A running dev session.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; it stops
/// every worker process.
pub struct DevRuntime {
    runtime_addr: SocketAddr,
    bus: EventBus,
    builders: BuilderSet,
    stack: Option<StackBuilder>,
    supervisor: Arc<Supervisor>,
    client_events: broadcast::Receiver<ClientEvent>,
    client_exit: watch::Receiver<Option<ClientExit>>,
    client_shutdown: Arc<Notify>,
    client_handle: JoinHandle<()>,
    supervisor_shutdown: Arc<Notify>,
    supervisor_handle: JoinHandle<()>,
    api_shutdown: Arc<Notify>,
    api_handle: JoinHandle<std::io::Result<()>>,
    tasks: Vec<JoinHandle<()>>,
    _watcher: Option<FileWatcher>,
}

impl DevRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DevRuntimeBuilder {
        DevRuntimeBuilder::new()
    }

    /// Address workers reach the Runtime API on.
    pub fn runtime_addr(&self) -> SocketAddr {
        self.runtime_addr
    }

    /// Subscribe to build, deploy and invocation events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    /// Subscribe to bridge client state changes.
    pub fn client_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.client_events.resubscribe()
    }

    /// Resolves to `Some` once the bridge client has stopped.
    pub fn client_exit(&self) -> watch::Receiver<Option<ClientExit>> {
        self.client_exit.clone()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn builders(&self) -> &BuilderSet {
        &self.builders
    }

    pub fn stack(&self) -> Option<&StackBuilder> {
        self.stack.as_ref()
    }

    /// Feed a file change by hand, as the watcher would.
    pub fn file_changed(&self, change: &FileChange) {
        route_change(change, &self.builders, self.stack.as_ref());
    }

    /// Deploy the pending stack assembly. Returns false without a stack.
    pub fn deploy(&self) -> bool {
        match &self.stack {
            Some(stack) => {
                stack.trigger_deploy();
                true
            }
            None => false,
        }
    }

    /// Check if the session is still serving.
    pub fn is_running(&self) -> bool {
        !self.client_handle.is_finished()
            && !self.supervisor_handle.is_finished()
            && !self.api_handle.is_finished()
    }

    /// Gracefully shut down the session.
    ///
    /// Stops the bridge client first so no new invocations arrive, then the
    /// supervisor (and its workers), then the Runtime API.
    pub async fn shutdown(self) -> Result<()> {
        info!("DevRuntime shutting down...");

        self.client_shutdown.notify_one();
        if let Err(e) = self.client_handle.await {
            error!("Bridge client task panicked: {}", e);
        }

        self.supervisor_shutdown.notify_one();
        if let Err(e) = self.supervisor_handle.await {
            error!("Supervisor task panicked: {}", e);
        }

        for task in &self.tasks {
            task.abort();
        }

        self.api_shutdown.notify_one();
        match self.api_handle.await {
            Ok(Ok(())) => {
                info!("DevRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Runtime API error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("Runtime API task panicked: {}", e);
                Err(anyhow::anyhow!("runtime API task panicked: {}", e))
            }
        }
    }
}

/// Serves relayed invocations through the supervisor.
struct SessionHandler {
    supervisor: Arc<Supervisor>,
    builders: BuilderSet,
}

#[async_trait]
impl InvocationHandler for SessionHandler {
    async fn handle(&self, payload: InvocationPayload) -> InvocationResult {
        if let Ok(builder) = self.builders.get(&payload.function_id) {
            builder.invoked();
        }

        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let invocation = Invocation::from_payload(&payload, now_ms);
        let reply = self
            .supervisor
            .dispatch(&payload.function_id, invocation, payload.env);

        reply.await.unwrap_or_else(|_| {
            InvocationResult::failure(
                UNAVAILABLE_TYPE,
                "local runtime stopped before the invocation finished",
            )
        })
    }
}

/// Resolves artifacts through the function builders.
struct BuilderArtifacts {
    builders: BuilderSet,
    commands: HashMap<String, Vec<String>>,
}

#[async_trait]
impl ArtifactProvider for BuilderArtifacts {
    async fn artifact(&self, function_id: &str) -> tether_runtime::Result<Artifact> {
        let failed = |errors: Vec<String>| tether_runtime::Error::BuildFailed {
            function_id: function_id.to_string(),
            errors,
        };

        let builder = self
            .builders
            .get(function_id)
            .map_err(|e| failed(vec![e.to_string()]))?;
        let command = self
            .commands
            .get(function_id)
            .cloned()
            .ok_or_else(|| failed(vec![format!("no worker command for {}", function_id)]))?;

        match builder.artifact().await {
            Ok(Ok(artifact)) => Ok(Artifact {
                path: artifact.artifact_path,
                handler: artifact.handler,
                command,
            }),
            Ok(Err(errors)) => Err(failed(errors)),
            Err(e) => Err(failed(vec![e.to_string()])),
        }
    }
}

/// Lifecycle event for a supervisor event, if observers care about it.
fn lifecycle_event(event: WorkerEvent) -> Option<LifecycleEvent> {
    match event {
        WorkerEvent::Invoked {
            function_id,
            worker_id,
            request_id,
        } => Some(LifecycleEvent::FunctionInvoked {
            function_id,
            worker_id,
            request_id,
        }),
        WorkerEvent::Completed {
            function_id,
            request_id,
            result,
            ..
        } => Some(match result {
            InvocationResult::Success { body } => LifecycleEvent::FunctionSuccess {
                function_id,
                request_id,
                body,
            },
            InvocationResult::Failure { error } => LifecycleEvent::FunctionError {
                function_id,
                request_id,
                error_type: error.error_type,
                error_message: error.error_message,
            },
        }),
        WorkerEvent::Log {
            function_id,
            worker_id,
            line,
        } => Some(LifecycleEvent::FunctionLog {
            function_id,
            worker_id,
            line,
        }),
        WorkerEvent::Started { .. } | WorkerEvent::Stopped { .. } => None,
    }
}

async fn forward_worker_events(mut events: broadcast::Receiver<WorkerEvent>, bus: EventBus) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let WorkerEvent::Log {
                    function_id, line, ..
                } = &event
                {
                    debug!(function_id = %function_id, "{}", line);
                }
                if let Some(event) = lifecycle_event(event) {
                    bus.publish(event);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Worker events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Retire workers running code that a rebuild replaced.
///
/// Follows the builder's snapshot rather than the lifecycle bus so a burst
/// of worker logs can never crowd out a rebuild.
async fn invalidate_on_rebuild(builder: FunctionBuilder, supervisor: Arc<Supervisor>) {
    let function_id = builder.function_id().to_string();
    let mut snapshots = builder.watch();
    let mut seen = snapshots.borrow_and_update().rebuilds;
    drop(builder);
    while snapshots.changed().await.is_ok() {
        let rebuilds = snapshots.borrow_and_update().rebuilds;
        if rebuilds > seen {
            seen = rebuilds;
            info!(function_id = %function_id, rebuilds, "Function rebuilt, retiring its worker");
            supervisor.invalidate(&function_id).await;
        }
    }
}

fn route_change(change: &FileChange, builders: &BuilderSet, stack: Option<&StackBuilder>) {
    let relevant = builders.file_changed(change);
    debug!(
        file = %change.relative_path.display(),
        functions = relevant,
        "Routing file change"
    );
    if let Some(stack) = stack {
        stack.file_changed();
    }
}

async fn route_changes(
    mut changes: mpsc::UnboundedReceiver<FileChange>,
    builders: BuilderSet,
    stack: Option<StackBuilder>,
) {
    while let Some(change) = changes.recv().await {
        route_change(&change, &builders, stack.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_protocol::RemoteError;

    #[test]
    fn test_lifecycle_event_mapping() {
        let success = lifecycle_event(WorkerEvent::Completed {
            function_id: "api".to_string(),
            worker_id: "api-1".to_string(),
            request_id: "abc-123".to_string(),
            result: InvocationResult::Success {
                body: json!({"status": "ok"}),
            },
        });
        assert_eq!(
            success,
            Some(LifecycleEvent::FunctionSuccess {
                function_id: "api".to_string(),
                request_id: "abc-123".to_string(),
                body: json!({"status": "ok"}),
            })
        );

        let failure = lifecycle_event(WorkerEvent::Completed {
            function_id: "api".to_string(),
            worker_id: "api-1".to_string(),
            request_id: "abc-124".to_string(),
            result: InvocationResult::Failure {
                error: RemoteError::new("TypeError", "x is undefined"),
            },
        });
        assert!(matches!(
            failure,
            Some(LifecycleEvent::FunctionError { error_type, .. }) if error_type == "TypeError"
        ));

        assert!(
            lifecycle_event(WorkerEvent::Started {
                function_id: "api".to_string(),
                worker_id: "api-1".to_string(),
            })
            .is_none()
        );
    }

    #[test]
    fn test_builder_requires_fields() {
        assert!(DevRuntime::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_unknown_function_fails_build() {
        let artifacts = BuilderArtifacts {
            builders: BuilderSet::new(),
            commands: HashMap::new(),
        };
        let err = artifacts.artifact("nope").await.unwrap_err();
        assert!(matches!(
            err,
            tether_runtime::Error::BuildFailed { function_id, .. } if function_id == "nope"
        ));
    }
}
