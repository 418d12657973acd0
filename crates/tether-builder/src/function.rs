// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function build state machine.
//!
//! ```text
//!              file change (warm, relevant)
//!     ┌──────┐ ─────────────────────────────► ┌──────────┐ ◄─┐ finished
//!     │ Idle │                                │ Building │ ──┘ while dirty
//!     └──────┘ ◄───────── failed ──────────── └────┬─────┘
//!         ▲                                        │ success
//!         │            checks merged          ┌────▼─────┐
//!         └────────────────────────────────── │ Checking │
//!                                             └──────────┘
//! ```
//!
//! [`FunctionMachine`] is the pure transition function. [`FunctionBuilder`]
//! is the actor that owns one machine, runs its effects on the toolchain and
//! publishes a [`FunctionSnapshot`] after every transition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use glob::Pattern;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::toolchain::{BuildMode, BuildOutput, FileChange, FunctionArtifact, FunctionToolchain, Issue};

/// Issue key holding build errors, next to the check names.
pub const BUILD_ISSUES: &str = "build";

/// A function known to the builder.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub id: String,
    /// Globs matched against the changed file's relative path
    pub watch: Vec<Pattern>,
    /// Names of the checks to run after every successful build
    pub checks: Vec<String>,
}

impl FunctionSpec {
    pub fn new(id: impl Into<String>, patterns: &[&str]) -> Result<Self> {
        let watch = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| Error::Pattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: id.into(),
            watch,
            checks: Vec::new(),
        })
    }

    pub fn with_checks(mut self, checks: Vec<String>) -> Self {
        self.checks = checks;
        self
    }

    pub fn matches(&self, change: &FileChange) -> bool {
        self.watch
            .iter()
            .any(|p| p.matches_path(&change.relative_path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    Idle,
    Building,
    Checking,
}

/// Inputs to the function machine.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionEvent {
    /// A relevant source file changed
    FileChanged,
    /// The function received a live invocation
    Invoked,
    /// An artifact is needed now, regardless of warmth
    BuildRequested,
    BuildFinished {
        generation: u64,
        output: BuildOutput,
    },
    ChecksFinished {
        generation: u64,
        issues: BTreeMap<String, Vec<Issue>>,
    },
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionEffect {
    StartBuild { generation: u64 },
    RunChecks { generation: u64, checks: Vec<String> },
    Publish(LifecycleEvent),
}

/// Observable state of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSnapshot {
    pub state: FunctionState,
    pub dirty: bool,
    /// Received at least one live invocation
    pub warm: bool,
    /// Builds started so far
    pub generation: u64,
    /// Successful builds that replaced an earlier artifact
    pub rebuilds: u64,
    pub build_started: Option<DateTime<Utc>>,
    pub artifact: Option<FunctionArtifact>,
    /// Issues keyed by check name, build errors under [`BUILD_ISSUES`]
    pub issues: BTreeMap<String, Vec<Issue>>,
}

/// Pure `(state, event) -> effects` transition function for one function.
#[derive(Debug, Clone)]
pub struct FunctionMachine {
    function_id: String,
    checks: Vec<String>,
    state: FunctionState,
    dirty: bool,
    warm: bool,
    generation: u64,
    rebuilds: u64,
    build_started: Option<DateTime<Utc>>,
    artifact: Option<FunctionArtifact>,
    issues: BTreeMap<String, Vec<Issue>>,
}

impl FunctionMachine {
    pub fn new(function_id: impl Into<String>, checks: Vec<String>) -> Self {
        Self {
            function_id: function_id.into(),
            checks,
            state: FunctionState::Idle,
            dirty: false,
            warm: false,
            generation: 0,
            rebuilds: 0,
            build_started: None,
            artifact: None,
            issues: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    pub fn snapshot(&self) -> FunctionSnapshot {
        FunctionSnapshot {
            state: self.state,
            dirty: self.dirty,
            warm: self.warm,
            generation: self.generation,
            rebuilds: self.rebuilds,
            build_started: self.build_started,
            artifact: self.artifact.clone(),
            issues: self.issues.clone(),
        }
    }

    /// Apply one event at time `now`.
    pub fn handle(&mut self, event: FunctionEvent, now: DateTime<Utc>) -> Vec<FunctionEffect> {
        match event {
            FunctionEvent::Invoked => {
                self.warm = true;
                Vec::new()
            }
            FunctionEvent::FileChanged => match self.state {
                _ if !self.warm => Vec::new(),
                FunctionState::Building => {
                    self.dirty = true;
                    Vec::new()
                }
                // Checking results of the old code are superseded
                FunctionState::Idle | FunctionState::Checking => self.start_build(now),
            },
            FunctionEvent::BuildRequested => match self.state {
                FunctionState::Idle if self.artifact.is_none() => self.start_build(now),
                _ => Vec::new(),
            },
            FunctionEvent::BuildFinished { generation, output } => {
                if self.state != FunctionState::Building || generation != self.generation {
                    return Vec::new();
                }
                self.finish_build(output, now)
            }
            FunctionEvent::ChecksFinished { generation, issues } => {
                if self.state != FunctionState::Checking || generation != self.generation {
                    return Vec::new();
                }
                for (check, found) in issues {
                    self.issues.insert(check, found);
                }
                self.state = FunctionState::Idle;
                vec![FunctionEffect::Publish(LifecycleEvent::FunctionChecked {
                    function_id: self.function_id.clone(),
                    issues: self.issues.clone(),
                })]
            }
        }
    }

    fn start_build(&mut self, now: DateTime<Utc>) -> Vec<FunctionEffect> {
        self.state = FunctionState::Building;
        self.dirty = false;
        self.generation += 1;
        self.build_started = Some(now);
        vec![
            FunctionEffect::Publish(LifecycleEvent::FunctionBuildStarted {
                function_id: self.function_id.clone(),
            }),
            FunctionEffect::StartBuild {
                generation: self.generation,
            },
        ]
    }

    fn finish_build(&mut self, output: BuildOutput, now: DateTime<Utc>) -> Vec<FunctionEffect> {
        let mut effects = Vec::new();
        let succeeded = match output {
            BuildOutput::Success(artifact) => {
                let rebuilt = self.artifact.is_some();
                if rebuilt {
                    self.rebuilds += 1;
                }
                self.artifact = Some(artifact);
                self.issues.insert(BUILD_ISSUES.to_string(), Vec::new());
                let duration_ms = self
                    .build_started
                    .map(|started| (now - started).num_milliseconds())
                    .unwrap_or(0);
                effects.push(FunctionEffect::Publish(LifecycleEvent::FunctionBuildSuccess {
                    function_id: self.function_id.clone(),
                    duration_ms,
                    rebuilt,
                }));
                true
            }
            BuildOutput::Error { errors } => {
                self.issues.insert(
                    BUILD_ISSUES.to_string(),
                    errors.iter().map(Issue::new).collect(),
                );
                effects.push(FunctionEffect::Publish(LifecycleEvent::FunctionBuildFailed {
                    function_id: self.function_id.clone(),
                    errors,
                }));
                false
            }
        };

        if self.dirty {
            effects.extend(self.start_build(now));
        } else if succeeded && !self.checks.is_empty() {
            self.state = FunctionState::Checking;
            effects.push(FunctionEffect::RunChecks {
                generation: self.generation,
                checks: self.checks.clone(),
            });
        } else {
            self.state = FunctionState::Idle;
        }
        effects
    }
}

/// Handle to a function's build actor.
///
/// The actor runs until every clone of the handle is dropped.
#[derive(Clone)]
pub struct FunctionBuilder {
    spec: Arc<FunctionSpec>,
    toolchain: Arc<dyn FunctionToolchain>,
    events: mpsc::UnboundedSender<FunctionEvent>,
    snapshot: watch::Receiver<FunctionSnapshot>,
}

impl FunctionBuilder {
    /// Spawn the actor for one function.
    pub fn spawn(
        spec: FunctionSpec,
        toolchain: Arc<dyn FunctionToolchain>,
        bus: EventBus,
        mode: BuildMode,
    ) -> Self {
        let machine = FunctionMachine::new(spec.id.clone(), spec.checks.clone());
        let (snapshot_tx, snapshot) = watch::channel(machine.snapshot());
        let (events, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine,
            toolchain: toolchain.clone(),
            bus,
            mode,
            snapshot: snapshot_tx,
        };
        tokio::spawn(driver.run(events_rx));

        Self {
            spec: Arc::new(spec),
            toolchain,
            events,
            snapshot,
        }
    }

    pub fn function_id(&self) -> &str {
        &self.spec.id
    }

    pub fn snapshot(&self) -> FunctionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every transition.
    pub fn watch(&self) -> watch::Receiver<FunctionSnapshot> {
        self.snapshot.clone()
    }

    /// Offer a file change. Returns whether it was relevant to this function.
    pub fn file_changed(&self, change: &FileChange) -> bool {
        let relevant =
            self.spec.matches(change) && self.toolchain.is_relevant(&self.spec.id, change);
        if relevant {
            debug!(
                function_id = %self.spec.id,
                file = %change.relative_path.display(),
                "Relevant file change"
            );
            self.send(FunctionEvent::FileChanged);
        }
        relevant
    }

    /// Mark the function warm.
    pub fn invoked(&self) {
        self.send(FunctionEvent::Invoked);
    }

    /// Latest artifact, building one first if there is none.
    ///
    /// Waits out an in-flight build so a rebuilt artifact is never skipped.
    /// When the function has no artifact the build errors are returned.
    pub async fn artifact(&self) -> Result<std::result::Result<FunctionArtifact, Vec<String>>> {
        let mut rx = self.snapshot.clone();
        let (needs_build, generation) = {
            let current = rx.borrow_and_update();
            (
                current.artifact.is_none() && current.state == FunctionState::Idle,
                current.generation,
            )
        };
        if needs_build {
            self.send(FunctionEvent::BuildRequested);
        }

        let settled = rx
            .wait_for(|s| {
                s.state != FunctionState::Building && (!needs_build || s.generation > generation)
            })
            .await
            .map_err(|_| Error::Stopped(self.spec.id.clone()))?
            .clone();

        Ok(match settled.artifact {
            Some(artifact) => Ok(artifact),
            None => Err(settled
                .issues
                .get(BUILD_ISSUES)
                .map(|issues| issues.iter().map(|i| i.message.clone()).collect())
                .unwrap_or_default()),
        })
    }

    fn send(&self, event: FunctionEvent) {
        if self.events.send(event).is_err() {
            warn!(function_id = %self.spec.id, "Function builder has stopped");
        }
    }
}

struct Driver {
    machine: FunctionMachine,
    toolchain: Arc<dyn FunctionToolchain>,
    bus: EventBus,
    mode: BuildMode,
    snapshot: watch::Sender<FunctionSnapshot>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<FunctionEvent>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(event) = done_rx.recv() => event,
            };

            let effects = self.machine.handle(event, Utc::now());
            for effect in effects {
                self.apply(effect, &done_tx);
            }
            self.snapshot.send_replace(self.machine.snapshot());
        }

        debug!(function_id = %self.machine.function_id, "Function builder stopped");
    }

    fn apply(&self, effect: FunctionEffect, done: &mpsc::UnboundedSender<FunctionEvent>) {
        let function_id = self.machine.function_id.clone();
        match effect {
            FunctionEffect::Publish(event) => self.bus.publish(event),
            FunctionEffect::StartBuild { generation } => {
                info!(function_id = %function_id, generation, "Building function");
                let toolchain = self.toolchain.clone();
                let done = done.clone();
                let mode = self.mode;
                tokio::spawn(async move {
                    let output = toolchain.build(&function_id, mode).await;
                    let _ = done.send(FunctionEvent::BuildFinished { generation, output });
                });
            }
            FunctionEffect::RunChecks { generation, checks } => {
                debug!(function_id = %function_id, ?checks, "Running checks");
                let toolchain = self.toolchain.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let results = join_all(checks.into_iter().map(|check| {
                        let toolchain = toolchain.clone();
                        let function_id = function_id.clone();
                        async move {
                            let issues = toolchain.check(&function_id, &check).await;
                            (check, issues)
                        }
                    }))
                    .await;
                    let _ = done.send(FunctionEvent::ChecksFinished {
                        generation,
                        issues: results.into_iter().collect(),
                    });
                });
            }
        }
    }
}

/// Build actors for every function of the application.
#[derive(Clone, Default)]
pub struct BuilderSet {
    builders: HashMap<String, FunctionBuilder>,
}

impl BuilderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, builder: FunctionBuilder) {
        self.builders
            .insert(builder.function_id().to_string(), builder);
    }

    pub fn get(&self, function_id: &str) -> Result<&FunctionBuilder> {
        self.builders
            .get(function_id)
            .ok_or_else(|| Error::UnknownFunction(function_id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Fan a file change out to every function. Returns how many found it
    /// relevant.
    pub fn file_changed(&self, change: &FileChange) -> usize {
        self.builders
            .values()
            .filter(|b| b.file_changed(change))
            .count()
    }
}
