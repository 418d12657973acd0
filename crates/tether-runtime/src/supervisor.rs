// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervisor.
//!
//! Owns the registry of running workers, one per function. Invocations
//! are queued per function and handed to the function's worker one at a
//! time: a worker never has more than one invocation in flight. Workers
//! are started lazily on the first invocation, replaced after a rebuild,
//! and torn down after an idle period.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_protocol::{InvocationResult, RemoteError};

use crate::api::{Invocation, RuntimeApi, RuntimeEvent};
use crate::error::{Error, Result};
use crate::launcher::{Artifact, LaunchOptions, Launched, Launcher, WorkerExit, WorkerHandle};

pub const BUILD_FAILED_TYPE: &str = "Runtime.BuildFailed";
pub const BUILD_FAILED_MESSAGE: &str = "Function failed to build";
pub const EXIT_ERROR_TYPE: &str = "Runtime.ExitError";
pub const START_FAILED_TYPE: &str = "Runtime.StartFailed";

/// Supplies the current artifact of a function
#[async_trait]
pub trait ArtifactProvider: Send + Sync {
    /// Return the latest artifact, building it first if there is none.
    async fn artifact(&self, function_id: &str) -> Result<Artifact>;
}

/// Configuration for the worker supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Idle time after which a worker is stopped
    pub idle_timeout: Duration,
    /// How often idle workers are looked for
    pub reap_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Why a worker was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Rebuilt,
    Exited,
    InitFailed,
    Requested,
    Shutdown,
}

/// Observable worker activity
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started {
        function_id: String,
        worker_id: String,
    },
    Stopped {
        function_id: String,
        worker_id: String,
        reason: StopReason,
    },
    Invoked {
        function_id: String,
        worker_id: String,
        request_id: String,
    },
    Completed {
        function_id: String,
        worker_id: String,
        request_id: String,
        result: InvocationResult,
    },
    Log {
        function_id: String,
        worker_id: String,
        line: String,
    },
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub function_id: String,
    pub busy: bool,
    /// Invocations completed so far; zero means the worker is still cold
    pub served: u64,
    /// Rebuilt while busy; stopped once the current invocation finishes
    pub stale: bool,
    pub started_at: DateTime<Utc>,
}

struct Pending {
    invocation: Invocation,
    env: BTreeMap<String, String>,
    reply: oneshot::Sender<InvocationResult>,
}

struct InFlight {
    request_id: String,
    reply: oneshot::Sender<InvocationResult>,
}

struct Worker {
    handle: WorkerHandle,
    in_flight: Option<InFlight>,
    served: u64,
    stale: bool,
    last_active: Instant,
}

#[derive(Default)]
struct FunctionSlot {
    queue: VecDeque<Pending>,
    worker: Option<String>,
    /// Bumped on every invalidation
    epoch: u64,
}

#[derive(Default)]
struct State {
    workers: HashMap<String, Worker>,
    functions: HashMap<String, FunctionSlot>,
}

impl State {
    /// Detach a worker from the registry.
    fn remove_worker(&mut self, worker_id: &str) -> Option<Worker> {
        let worker = self.workers.remove(worker_id)?;
        if let Some(slot) = self.functions.get_mut(&worker.handle.function_id)
            && slot.worker.as_deref() == Some(worker_id)
        {
            slot.worker = None;
        }
        Some(worker)
    }

    fn function_of(&self, worker_id: &str) -> Option<String> {
        self.workers
            .get(worker_id)
            .map(|w| w.handle.function_id.clone())
    }
}

/// Starts, feeds and stops workers
pub struct Supervisor {
    api: Arc<RuntimeApi>,
    launcher: Arc<dyn Launcher>,
    artifacts: Arc<dyn ArtifactProvider>,
    runtime_addr: SocketAddr,
    config: SupervisorConfig,
    state: Mutex<State>,
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    api_events: Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
    exits_tx: mpsc::UnboundedSender<(String, WorkerExit)>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, WorkerExit)>>>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: Arc<Notify>,
}

impl Supervisor {
    /// Create a supervisor. `api_events` is the receiver returned by
    /// [`RuntimeApi::new`]; `runtime_addr` is where the API is served.
    pub fn new(
        api: Arc<RuntimeApi>,
        api_events: mpsc::UnboundedReceiver<RuntimeEvent>,
        launcher: Arc<dyn Launcher>,
        artifacts: Arc<dyn ArtifactProvider>,
        runtime_addr: SocketAddr,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            launcher,
            artifacts,
            runtime_addr,
            config,
            state: Mutex::new(State::default()),
            start_locks: Mutex::new(HashMap::new()),
            api_events: Mutex::new(Some(api_events)),
            exits_tx,
            exits_rx: Mutex::new(Some(exits_rx)),
            events,
            shutdown: Arc::new(Notify::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn api(&self) -> &Arc<RuntimeApi> {
        &self.api
    }

    /// Running workers
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.state()
            .workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                worker_id: id.clone(),
                function_id: w.handle.function_id.clone(),
                busy: w.in_flight.is_some(),
                served: w.served,
                stale: w.stale,
                started_at: w.handle.started_at,
            })
            .collect()
    }

    /// Worker currently serving a function
    pub fn worker_for(&self, function_id: &str) -> Option<String> {
        self.state()
            .functions
            .get(function_id)
            .and_then(|slot| slot.worker.clone())
    }

    /// Invocations waiting for a free worker
    pub fn queued(&self, function_id: &str) -> usize {
        self.state()
            .functions
            .get(function_id)
            .map_or(0, |slot| slot.queue.len())
    }

    fn epoch(&self, function_id: &str) -> u64 {
        self.state()
            .functions
            .get(function_id)
            .map_or(0, |slot| slot.epoch)
    }

    fn start_lock(&self, function_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.start_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(function_id.to_string())
            .or_default()
            .clone()
    }

    /// Return the function's worker, starting one if needed.
    ///
    /// A worker launched from an artifact that an invalidation overtook is
    /// stopped as soon as it is registered.
    pub async fn ensure_worker(
        self: &Arc<Self>,
        function_id: &str,
        env: BTreeMap<String, String>,
    ) -> Result<String> {
        let lock = self.start_lock(function_id);
        let _guard = lock.lock().await;

        if let Some(worker_id) = self.worker_for(function_id) {
            return Ok(worker_id);
        }

        let (artifact, epoch) = loop {
            let epoch = self.epoch(function_id);
            let artifact = self.artifacts.artifact(function_id).await?;
            if self.epoch(function_id) == epoch {
                break (artifact, epoch);
            }
            debug!(function_id, "rebuilt while fetching artifact, fetching again");
        };
        let suffix = Uuid::new_v4().simple().to_string();
        let worker_id = format!("{function_id}-{}", &suffix[..12]);
        let options = LaunchOptions {
            worker_id: worker_id.clone(),
            function_id: function_id.to_string(),
            artifact,
            runtime_api: format!("{}/{}", self.runtime_addr, worker_id),
            env,
        };

        let Launched {
            handle,
            exit,
            mut logs,
        } = self.launcher.launch(&options).await?;

        let stale = {
            let mut state = self.state();
            let State { workers, functions } = &mut *state;
            let slot = functions.entry(function_id.to_string()).or_default();
            let stale = slot.epoch != epoch;
            slot.worker = Some(worker_id.clone());
            workers.insert(
                worker_id.clone(),
                Worker {
                    handle,
                    in_flight: None,
                    served: 0,
                    stale,
                    last_active: Instant::now(),
                },
            );
            stale
        };

        let exits = self.exits_tx.clone();
        let exited = worker_id.clone();
        tokio::spawn(async move {
            // A stopped worker drops its exit sender
            if let Ok(exit) = exit.await {
                let _ = exits.send((exited, exit));
            }
        });

        let events = self.events.clone();
        let (log_function, log_worker) = (function_id.to_string(), worker_id.clone());
        tokio::spawn(async move {
            while let Some(line) = logs.recv().await {
                let _ = events.send(WorkerEvent::Log {
                    function_id: log_function.clone(),
                    worker_id: log_worker.clone(),
                    line,
                });
            }
        });

        info!(function_id, worker_id = %worker_id, launcher = self.launcher.launcher_type(), "Worker started");
        self.emit(WorkerEvent::Started {
            function_id: function_id.to_string(),
            worker_id: worker_id.clone(),
        });

        if stale
            && let Err(e) = self.stop_with(&worker_id, StopReason::Rebuilt).await
        {
            warn!(function_id, worker_id = %worker_id, error = %e, "Failed to stop outdated worker");
        }
        Ok(worker_id)
    }

    /// Queue an invocation for a function. The receiver resolves with its result.
    pub fn dispatch(
        self: &Arc<Self>,
        function_id: &str,
        invocation: Invocation,
        env: BTreeMap<String, String>,
    ) -> oneshot::Receiver<InvocationResult> {
        let (reply, rx) = oneshot::channel();
        debug!(function_id, request_id = %invocation.request_id, "dispatching invocation");
        self.state()
            .functions
            .entry(function_id.to_string())
            .or_default()
            .queue
            .push_back(Pending {
                invocation,
                env,
                reply,
            });
        self.advance(function_id);
        rx
    }

    /// Hand the next queued invocation to the worker, or start one.
    fn advance(self: &Arc<Self>, function_id: &str) {
        let needs_start = {
            let state = self.state();
            state
                .functions
                .get(function_id)
                .is_some_and(|slot| slot.worker.is_none() && !slot.queue.is_empty())
        };
        if needs_start {
            self.spawn_start(function_id);
        } else {
            self.pump(function_id);
        }
    }

    fn spawn_start(self: &Arc<Self>, function_id: &str) {
        let this = self.clone();
        let function_id = function_id.to_string();
        tokio::spawn(async move {
            let env = this
                .state()
                .functions
                .get(&function_id)
                .and_then(|slot| slot.queue.front())
                .map(|pending| pending.env.clone())
                .unwrap_or_default();

            match this.ensure_worker(&function_id, env).await {
                Ok(_) => this.pump(&function_id),
                Err(Error::BuildFailed { errors, .. }) => {
                    warn!(function_id = %function_id, errors = ?errors, "Build failed, failing queued invocations");
                    this.fail_queue(
                        &function_id,
                        RemoteError::new(BUILD_FAILED_TYPE, BUILD_FAILED_MESSAGE),
                    );
                }
                Err(e) => {
                    error!(function_id = %function_id, error = %e, "Failed to start worker");
                    this.fail_queue(&function_id, RemoteError::new(START_FAILED_TYPE, e.to_string()));
                }
            }
        });
    }

    fn pump(&self, function_id: &str) {
        let mut state = self.state();
        let State { workers, functions } = &mut *state;
        let Some(slot) = functions.get_mut(function_id) else {
            return;
        };
        let Some(worker_id) = slot.worker.clone() else {
            return;
        };
        let Some(worker) = workers.get_mut(&worker_id) else {
            return;
        };
        if worker.in_flight.is_some() || worker.stale {
            return;
        }

        while let Some(pending) = slot.queue.pop_front() {
            if pending.reply.is_closed() {
                debug!(function_id, request_id = %pending.invocation.request_id, "caller gone, skipping");
                continue;
            }
            worker.in_flight = Some(InFlight {
                request_id: pending.invocation.request_id.clone(),
                reply: pending.reply,
            });
            worker.last_active = Instant::now();
            self.api.enqueue(&worker_id, pending.invocation);
            return;
        }
    }

    fn fail_queue(&self, function_id: &str, error: RemoteError) {
        let drained: Vec<Pending> = self
            .state()
            .functions
            .get_mut(function_id)
            .map(|slot| slot.queue.drain(..).collect())
            .unwrap_or_default();
        for pending in drained {
            let _ = pending.reply.send(InvocationResult::Failure {
                error: error.clone(),
            });
        }
    }

    /// Stop a worker on request.
    pub async fn stop_worker(self: &Arc<Self>, worker_id: &str) -> Result<()> {
        self.stop_with(worker_id, StopReason::Requested).await
    }

    async fn stop_with(self: &Arc<Self>, worker_id: &str, reason: StopReason) -> Result<()> {
        let worker = self
            .state()
            .remove_worker(worker_id)
            .ok_or_else(|| Error::WorkerNotFound(worker_id.to_string()))?;
        self.api.remove_worker(worker_id);

        if let Some(in_flight) = worker.in_flight {
            let _ = in_flight.reply.send(InvocationResult::failure(
                EXIT_ERROR_TYPE,
                "Worker stopped before responding",
            ));
        }

        let function_id = worker.handle.function_id.clone();
        info!(function_id = %function_id, worker_id, reason = ?reason, "Stopping worker");
        let stopped = self.launcher.stop(&worker.handle).await;
        self.emit(WorkerEvent::Stopped {
            function_id: function_id.clone(),
            worker_id: worker_id.to_string(),
            reason,
        });

        if reason != StopReason::Shutdown {
            self.advance(&function_id);
        }
        Ok(stopped?)
    }

    /// Retire the function's worker after a successful rebuild.
    ///
    /// An idle worker is stopped now; a busy one finishes its invocation
    /// first. The next invocation cold-starts a fresh worker.
    pub async fn invalidate(self: &Arc<Self>, function_id: &str) {
        let idle_worker = {
            let mut state = self.state();
            let State { workers, functions } = &mut *state;
            let slot = functions.entry(function_id.to_string()).or_default();
            slot.epoch += 1;
            let worker_id = slot.worker.clone();
            match worker_id.and_then(|id| workers.get_mut(&id).map(|w| (id, w))) {
                Some((_, worker)) if worker.in_flight.is_some() => {
                    debug!(function_id, "worker busy, retiring after current invocation");
                    worker.stale = true;
                    None
                }
                Some((id, _)) => Some(id),
                None => None,
            }
        };

        if let Some(worker_id) = idle_worker
            && let Err(e) = self.stop_with(&worker_id, StopReason::Rebuilt).await
        {
            warn!(function_id, worker_id = %worker_id, error = %e, "Failed to stop rebuilt worker");
        }
    }

    async fn complete(self: &Arc<Self>, worker_id: &str, request_id: &str, result: InvocationResult) {
        let finished = {
            let mut state = self.state();
            let Some(worker) = state.workers.get_mut(worker_id) else {
                warn!(worker_id, request_id, "result from unknown worker");
                return;
            };
            match worker.in_flight.take() {
                Some(in_flight) if in_flight.request_id == request_id => {
                    worker.served += 1;
                    worker.last_active = Instant::now();
                    Some((worker.handle.function_id.clone(), worker.stale, in_flight.reply))
                }
                other => {
                    worker.in_flight = other;
                    None
                }
            }
        };
        let Some((function_id, stale, reply)) = finished else {
            warn!(worker_id, request_id, "result for an invocation the worker does not hold");
            return;
        };

        debug!(function_id = %function_id, worker_id, request_id, success = result.is_success(), "invocation completed");
        let _ = reply.send(result.clone());
        self.emit(WorkerEvent::Completed {
            function_id: function_id.clone(),
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
            result,
        });

        if stale {
            if let Err(e) = self.stop_with(worker_id, StopReason::Rebuilt).await {
                warn!(worker_id, error = %e, "Failed to stop stale worker");
            }
        } else {
            self.advance(&function_id);
        }
    }

    async fn handle_api_event(self: &Arc<Self>, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Invoked {
                worker_id,
                request_id,
            } => {
                if let Some(function_id) = self.state().function_of(&worker_id) {
                    self.emit(WorkerEvent::Invoked {
                        function_id,
                        worker_id,
                        request_id,
                    });
                }
            }
            RuntimeEvent::Success {
                worker_id,
                request_id,
                body,
            } => {
                self.complete(&worker_id, &request_id, InvocationResult::Success { body })
                    .await
            }
            RuntimeEvent::Error {
                worker_id,
                request_id,
                error,
            } => {
                self.complete(&worker_id, &request_id, InvocationResult::Failure { error })
                    .await
            }
            RuntimeEvent::InitError { worker_id, error } => {
                let Some(function_id) = self.state().function_of(&worker_id) else {
                    return;
                };
                // Queued invocations get the init error too, not another cold start
                self.fail_queue(&function_id, error.clone());
                let in_flight = self
                    .state()
                    .workers
                    .get_mut(&worker_id)
                    .and_then(|w| w.in_flight.take());
                if let Some(in_flight) = in_flight {
                    let _ = in_flight.reply.send(InvocationResult::Failure { error });
                }
                if let Err(e) = self.stop_with(&worker_id, StopReason::InitFailed).await {
                    warn!(worker_id = %worker_id, error = %e, "Failed to stop worker after init error");
                }
            }
        }
    }

    async fn handle_exit(self: &Arc<Self>, worker_id: &str, exit: WorkerExit) {
        let Some(worker) = self.state().remove_worker(worker_id) else {
            debug!(worker_id, "exit of a worker that was already stopped");
            return;
        };
        self.api.remove_worker(worker_id);

        let function_id = worker.handle.function_id.clone();
        let message = match exit.code {
            Some(code) => format!("Worker exited with code {code}"),
            None => "Worker was killed by a signal".to_string(),
        };
        warn!(function_id = %function_id, worker_id, %message, "Worker exited");

        if let Some(in_flight) = worker.in_flight {
            let _ = in_flight
                .reply
                .send(InvocationResult::failure(EXIT_ERROR_TYPE, message));
        }
        self.emit(WorkerEvent::Stopped {
            function_id: function_id.clone(),
            worker_id: worker_id.to_string(),
            reason: StopReason::Exited,
        });
        self.advance(&function_id);
    }

    async fn reap_idle(self: &Arc<Self>) {
        let idle: Vec<String> = self
            .state()
            .workers
            .iter()
            .filter(|(_, w)| w.in_flight.is_none() && w.last_active.elapsed() >= self.config.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in idle {
            if let Err(e) = self.stop_with(&worker_id, StopReason::Idle).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to stop idle worker");
            }
        }
    }

    /// Run the supervisor loop until shutdown, then stop every worker.
    pub async fn run(self: Arc<Self>) {
        let api_events = self
            .api_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let exits = self
            .exits_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(mut api_events), Some(mut exits)) = (api_events, exits) else {
            warn!("Supervisor is already running");
            return;
        };

        info!(
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            runtime_addr = %self.runtime_addr,
            "Supervisor started"
        );

        let period = self.config.reap_interval;
        let mut reaper = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Supervisor received shutdown signal");
                    break;
                }

                Some(event) = api_events.recv() => self.handle_api_event(event).await,

                Some((worker_id, exit)) = exits.recv() => self.handle_exit(&worker_id, exit).await,

                _ = reaper.tick() => self.reap_idle().await,
            }
        }

        let worker_ids: Vec<String> = self.state().workers.keys().cloned().collect();
        for worker_id in worker_ids {
            if let Err(e) = self.stop_with(&worker_id, StopReason::Shutdown).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to stop worker on shutdown");
            }
        }
        info!("Supervisor stopped");
    }
}
