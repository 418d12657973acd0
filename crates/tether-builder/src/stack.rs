// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application-wide stack build, synth and deploy state machine.
//!
//! ```text
//!  file change ─► Building ─► Synthing ─┬─► Idle(Unchanged)   checksum == deployed
//!                    │           │      └─► Deployable ──trigger──► Deploying ─► Idle(Deployed)
//!                    ▼           ▼                                      │
//!             Failed(Build) Failed(Synth)                         Failed(Deploy)
//! ```
//!
//! Every stage checks the dirty flag first when it finishes and restarts at
//! `Building` if a change arrived meanwhile. Deploys only happen on an
//! explicit [`StackBuilder::trigger_deploy`] and are never retried.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::checksum::assembly_checksum;
use crate::events::{EventBus, LifecycleEvent};
use crate::toolchain::{Assembly, StackDeployResult, StackToolchain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// Nothing built yet
    Initial,
    /// Synthesized output matches what is deployed
    Unchanged,
    Deployed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Build,
    Synth,
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Idle(IdleReason),
    Building,
    Synthing,
    /// Synthesized, waiting for a deploy trigger
    Deployable,
    Deploying,
    Failed(FailedStage),
}

impl StackState {
    fn is_busy(self) -> bool {
        matches!(self, Self::Building | Self::Synthing | Self::Deploying)
    }
}

/// Inputs to the stack machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    FileChanged,
    BuildFinished(Result<(), Vec<String>>),
    /// Synthesized assembly and its checksum
    SynthFinished(Result<(Assembly, String), Vec<String>>),
    TriggerDeploy,
    DeployFinished(BTreeMap<String, StackDeployResult>),
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEffect {
    Build,
    Synth,
    Deploy(Assembly),
    Publish(LifecycleEvent),
}

/// Observable stack state.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSnapshot {
    pub state: StackState,
    pub dirty: bool,
    pub deployed_checksum: Option<String>,
    /// Synthesized but not yet deployed
    pub pending_checksum: Option<String>,
    /// Errors of the last failed stage
    pub errors: Vec<String>,
}

/// Pure `(state, event) -> effects` transition function for the stacks.
#[derive(Debug, Clone)]
pub struct StackMachine {
    state: StackState,
    dirty: bool,
    deployed_checksum: Option<String>,
    pending_checksum: Option<String>,
    assembly: Option<Assembly>,
    errors: Vec<String>,
}

impl Default for StackMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StackMachine {
    pub fn new() -> Self {
        Self {
            state: StackState::Idle(IdleReason::Initial),
            dirty: false,
            deployed_checksum: None,
            pending_checksum: None,
            assembly: None,
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            state: self.state,
            dirty: self.dirty,
            deployed_checksum: self.deployed_checksum.clone(),
            pending_checksum: self.pending_checksum.clone(),
            errors: self.errors.clone(),
        }
    }

    pub fn handle(&mut self, event: StackEvent) -> Vec<StackEffect> {
        match (self.state, event) {
            (state, StackEvent::FileChanged) => {
                self.dirty = true;
                if state.is_busy() {
                    Vec::new()
                } else {
                    self.restart()
                }
            }

            (StackState::Building, StackEvent::BuildFinished(result)) => {
                if self.dirty {
                    return self.restart();
                }
                match result {
                    Ok(()) => {
                        self.state = StackState::Synthing;
                        vec![
                            StackEffect::Publish(LifecycleEvent::StackBuildSuccess),
                            StackEffect::Synth,
                        ]
                    }
                    Err(errors) => self.fail(FailedStage::Build, errors),
                }
            }

            (StackState::Synthing, StackEvent::SynthFinished(result)) => {
                if self.dirty {
                    return self.restart();
                }
                match result {
                    Ok((_, checksum)) if self.deployed_checksum.as_ref() == Some(&checksum) => {
                        self.state = StackState::Idle(IdleReason::Unchanged);
                        self.pending_checksum = None;
                        self.assembly = None;
                        vec![StackEffect::Publish(LifecycleEvent::StackSynthUnchanged {
                            checksum,
                        })]
                    }
                    Ok((assembly, checksum)) => {
                        self.state = StackState::Deployable;
                        self.pending_checksum = Some(checksum.clone());
                        self.assembly = Some(assembly);
                        vec![StackEffect::Publish(LifecycleEvent::StackSynthSuccess {
                            checksum,
                        })]
                    }
                    Err(errors) => self.fail(FailedStage::Synth, errors),
                }
            }

            (StackState::Deployable, StackEvent::TriggerDeploy) => {
                let (Some(assembly), Some(checksum)) =
                    (self.assembly.clone(), self.pending_checksum.clone())
                else {
                    return Vec::new();
                };
                self.state = StackState::Deploying;
                vec![
                    StackEffect::Publish(LifecycleEvent::StackDeployStarted { checksum }),
                    StackEffect::Deploy(assembly),
                ]
            }

            (StackState::Deploying, StackEvent::DeployFinished(stacks)) => {
                let errors: Vec<String> = stacks
                    .iter()
                    .filter(|(_, result)| result.is_failure())
                    .flat_map(|(name, result)| {
                        if result.errors.is_empty() {
                            vec![format!("{}: deploy failed", name)]
                        } else {
                            result
                                .errors
                                .iter()
                                .map(|e| format!("{}: {}", name, e))
                                .collect()
                        }
                    })
                    .collect();

                let mut effects = Vec::new();
                if errors.is_empty() {
                    let checksum = self.pending_checksum.take().unwrap_or_default();
                    self.deployed_checksum = Some(checksum.clone());
                    self.assembly = None;
                    self.state = StackState::Idle(IdleReason::Deployed);
                    effects.push(StackEffect::Publish(LifecycleEvent::StackDeployed {
                        checksum,
                        stacks,
                    }));
                } else {
                    self.state = StackState::Failed(FailedStage::Deploy);
                    self.errors = errors.clone();
                    effects.push(StackEffect::Publish(LifecycleEvent::StackDeployFailed {
                        errors,
                        stacks,
                    }));
                }
                if self.dirty {
                    effects.extend(self.restart());
                }
                effects
            }

            // Triggers outside Deployable and results for another stage
            _ => Vec::new(),
        }
    }

    fn restart(&mut self) -> Vec<StackEffect> {
        self.state = StackState::Building;
        self.dirty = false;
        self.errors.clear();
        vec![
            StackEffect::Publish(LifecycleEvent::StackBuildStarted),
            StackEffect::Build,
        ]
    }

    fn fail(&mut self, stage: FailedStage, errors: Vec<String>) -> Vec<StackEffect> {
        self.state = StackState::Failed(stage);
        self.errors = errors.clone();
        let event = match stage {
            FailedStage::Build => LifecycleEvent::StackBuildFailed { errors },
            FailedStage::Synth => LifecycleEvent::StackSynthFailed { errors },
            FailedStage::Deploy => LifecycleEvent::StackDeployFailed {
                errors,
                stacks: BTreeMap::new(),
            },
        };
        vec![StackEffect::Publish(event)]
    }
}

/// Handle to the stack build actor.
///
/// The actor runs until every clone of the handle is dropped.
#[derive(Clone)]
pub struct StackBuilder {
    events: mpsc::UnboundedSender<StackEvent>,
    snapshot: watch::Receiver<StackSnapshot>,
}

impl StackBuilder {
    pub fn spawn(toolchain: Arc<dyn StackToolchain>, bus: EventBus) -> Self {
        let machine = StackMachine::new();
        let (snapshot_tx, snapshot) = watch::channel(machine.snapshot());
        let (events, events_rx) = mpsc::unbounded_channel();

        let driver = StackDriver {
            machine,
            toolchain,
            bus,
            snapshot: snapshot_tx,
        };
        tokio::spawn(driver.run(events_rx));

        Self { events, snapshot }
    }

    pub fn file_changed(&self) {
        self.send(StackEvent::FileChanged);
    }

    /// Deploy the pending assembly. Ignored unless the stack is deployable.
    pub fn trigger_deploy(&self) {
        self.send(StackEvent::TriggerDeploy);
    }

    pub fn snapshot(&self) -> StackSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StackSnapshot> {
        self.snapshot.clone()
    }

    fn send(&self, event: StackEvent) {
        if self.events.send(event).is_err() {
            warn!("Stack builder has stopped");
        }
    }
}

struct StackDriver {
    machine: StackMachine,
    toolchain: Arc<dyn StackToolchain>,
    bus: EventBus,
    snapshot: watch::Sender<StackSnapshot>,
}

impl StackDriver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<StackEvent>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(event) = done_rx.recv() => event,
            };

            let before = self.machine.state();
            let effects = self.machine.handle(event);
            if before != self.machine.state() {
                debug!(from = ?before, to = ?self.machine.state(), "Stack transition");
            }
            for effect in effects {
                self.apply(effect, &done_tx);
            }
            self.snapshot.send_replace(self.machine.snapshot());
        }

        debug!("Stack builder stopped");
    }

    fn apply(&self, effect: StackEffect, done: &mpsc::UnboundedSender<StackEvent>) {
        let toolchain = self.toolchain.clone();
        let done = done.clone();
        match effect {
            StackEffect::Publish(event) => self.bus.publish(event),
            StackEffect::Build => {
                info!("Building stacks");
                tokio::spawn(async move {
                    let result = toolchain.build().await;
                    let _ = done.send(StackEvent::BuildFinished(result));
                });
            }
            StackEffect::Synth => {
                tokio::spawn(async move {
                    let result = match toolchain.synth().await {
                        Ok(assembly) => match assembly_checksum(&assembly.dir).await {
                            Ok(checksum) => Ok((assembly, checksum)),
                            Err(e) => Err(vec![e.to_string()]),
                        },
                        Err(errors) => Err(errors),
                    };
                    let _ = done.send(StackEvent::SynthFinished(result));
                });
            }
            StackEffect::Deploy(assembly) => {
                info!(assembly = %assembly.dir.display(), "Deploying stacks");
                tokio::spawn(async move {
                    let stacks = toolchain.deploy(&assembly).await;
                    let _ = done.send(StackEvent::DeployFinished(stacks));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::MockStackToolchain;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn assembly() -> Assembly {
        Assembly {
            dir: PathBuf::from(".tether/cdk.out"),
        }
    }

    fn synthed(checksum: &str) -> StackEvent {
        StackEvent::SynthFinished(Ok((assembly(), checksum.to_string())))
    }

    fn deployed_ok() -> StackEvent {
        let mut stacks = BTreeMap::new();
        stacks.insert("app-dev-api".to_string(), StackDeployResult::succeeded());
        StackEvent::DeployFinished(stacks)
    }

    fn deploys(effects: &[StackEffect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, StackEffect::Deploy(_)))
            .count()
    }

    /// Drive a machine from a file change to the end of synth.
    fn cycle(machine: &mut StackMachine, checksum: &str) {
        machine.handle(StackEvent::FileChanged);
        machine.handle(StackEvent::BuildFinished(Ok(())));
        machine.handle(synthed(checksum));
    }

    #[test]
    fn test_file_change_starts_build() {
        let mut machine = StackMachine::new();
        assert_eq!(machine.state(), StackState::Idle(IdleReason::Initial));
        let effects = machine.handle(StackEvent::FileChanged);
        assert_eq!(
            effects,
            vec![
                StackEffect::Publish(LifecycleEvent::StackBuildStarted),
                StackEffect::Build
            ]
        );
        assert_eq!(machine.state(), StackState::Building);
    }

    #[test]
    fn test_synth_waits_for_trigger_then_deploys() {
        let mut machine = StackMachine::new();
        cycle(&mut machine, "c1");
        assert_eq!(machine.state(), StackState::Deployable);
        assert_eq!(machine.snapshot().pending_checksum.as_deref(), Some("c1"));

        let effects = machine.handle(StackEvent::TriggerDeploy);
        assert_eq!(deploys(&effects), 1);
        assert_eq!(machine.state(), StackState::Deploying);

        machine.handle(deployed_ok());
        assert_eq!(machine.state(), StackState::Idle(IdleReason::Deployed));
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.deployed_checksum.as_deref(), Some("c1"));
        assert_eq!(snapshot.pending_checksum, None);
    }

    #[test]
    fn test_same_checksum_is_unchanged() {
        let mut machine = StackMachine::new();
        cycle(&mut machine, "c1");
        machine.handle(StackEvent::TriggerDeploy);
        machine.handle(deployed_ok());

        cycle(&mut machine, "c1");
        assert_eq!(machine.state(), StackState::Idle(IdleReason::Unchanged));
        assert!(machine.handle(StackEvent::TriggerDeploy).is_empty());
    }

    #[test]
    fn test_never_deploys_same_checksum_twice() {
        let mut machine = StackMachine::new();
        let mut deployed = Vec::new();
        for checksum in ["c1", "c1", "c2", "c2", "c2", "c1"] {
            cycle(&mut machine, checksum);
            for _ in 0..2 {
                if deploys(&machine.handle(StackEvent::TriggerDeploy)) > 0 {
                    deployed.push(checksum);
                    machine.handle(deployed_ok());
                }
            }
        }
        assert_eq!(deployed, vec!["c1", "c2", "c1"]);
    }

    #[test]
    fn test_trigger_ignored_outside_deployable() {
        let mut machine = StackMachine::new();
        assert!(machine.handle(StackEvent::TriggerDeploy).is_empty());
        machine.handle(StackEvent::FileChanged);
        assert!(machine.handle(StackEvent::TriggerDeploy).is_empty());
        assert_eq!(machine.state(), StackState::Building);
    }

    #[test]
    fn test_dirty_restarts_after_each_stage() {
        let mut machine = StackMachine::new();
        machine.handle(StackEvent::FileChanged);
        machine.handle(StackEvent::FileChanged);
        // Build failed, but a newer change is pending
        let effects = machine.handle(StackEvent::BuildFinished(Err(vec!["tsc".to_string()])));
        assert!(effects.contains(&StackEffect::Build));
        assert_eq!(machine.state(), StackState::Building);

        machine.handle(StackEvent::BuildFinished(Ok(())));
        machine.handle(StackEvent::FileChanged);
        let effects = machine.handle(synthed("c1"));
        assert!(effects.contains(&StackEffect::Build));
        assert_eq!(machine.snapshot().pending_checksum, None);

        machine.handle(StackEvent::BuildFinished(Ok(())));
        machine.handle(synthed("c2"));
        machine.handle(StackEvent::TriggerDeploy);
        machine.handle(StackEvent::FileChanged);
        let effects = machine.handle(deployed_ok());
        assert!(effects.contains(&StackEffect::Build));
        assert_eq!(machine.state(), StackState::Building);
        assert_eq!(machine.snapshot().deployed_checksum.as_deref(), Some("c2"));
    }

    #[test]
    fn test_change_while_deployable_restarts() {
        let mut machine = StackMachine::new();
        cycle(&mut machine, "c1");
        let effects = machine.handle(StackEvent::FileChanged);
        assert!(effects.contains(&StackEffect::Build));
        assert_eq!(machine.state(), StackState::Building);
    }

    #[test]
    fn test_failed_stages() {
        let mut machine = StackMachine::new();
        machine.handle(StackEvent::FileChanged);
        machine.handle(StackEvent::BuildFinished(Err(vec!["esbuild".to_string()])));
        assert_eq!(machine.state(), StackState::Failed(FailedStage::Build));
        assert_eq!(machine.snapshot().errors, vec!["esbuild".to_string()]);

        machine.handle(StackEvent::FileChanged);
        machine.handle(StackEvent::BuildFinished(Ok(())));
        machine.handle(StackEvent::SynthFinished(Err(vec!["cdk".to_string()])));
        assert_eq!(machine.state(), StackState::Failed(FailedStage::Synth));
    }

    #[test]
    fn test_deploy_failure_needs_new_change() {
        let mut machine = StackMachine::new();
        cycle(&mut machine, "c1");
        machine.handle(StackEvent::TriggerDeploy);

        let mut stacks = BTreeMap::new();
        stacks.insert("app-dev-api".to_string(), StackDeployResult::succeeded());
        stacks.insert(
            "app-dev-web".to_string(),
            StackDeployResult::failed(vec!["UPDATE_ROLLBACK_COMPLETE".to_string()]),
        );
        let effects = machine.handle(StackEvent::DeployFinished(stacks));
        assert_eq!(machine.state(), StackState::Failed(FailedStage::Deploy));
        assert!(matches!(
            &effects[0],
            StackEffect::Publish(LifecycleEvent::StackDeployFailed { errors, .. })
                if errors == &vec!["app-dev-web: UPDATE_ROLLBACK_COMPLETE".to_string()]
        ));
        assert_eq!(machine.snapshot().deployed_checksum, None);

        // No automatic retry
        assert!(machine.handle(StackEvent::TriggerDeploy).is_empty());
        assert!(machine.handle(StackEvent::FileChanged).contains(&StackEffect::Build));
    }

    fn write_assembly(dir: &Path, template: &str) {
        std::fs::write(dir.join("app-dev-api.template.json"), template).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"artifacts":{"app-dev-api":{"type":"aws:cloudformation:stack","properties":{"templateFile":"app-dev-api.template.json"}}}}"#,
        )
        .unwrap();
    }

    async fn settle(rx: &mut watch::Receiver<StackSnapshot>, state: StackState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_actor_deploys_on_trigger_only() {
        let out = TempDir::new().unwrap();
        write_assembly(out.path(), r#"{"Resources":{}}"#);
        let toolchain = Arc::new(MockStackToolchain::new(out.path()));
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let stack = StackBuilder::spawn(toolchain.clone(), bus);
        let mut rx = stack.watch();

        stack.file_changed();
        settle(&mut rx, StackState::Deployable).await;
        assert!(toolchain.deploys().is_empty());
        assert_eq!(stack.snapshot().pending_checksum.as_ref().map(String::len), Some(64));

        stack.trigger_deploy();
        settle(&mut rx, StackState::Idle(IdleReason::Deployed)).await;
        assert_eq!(toolchain.deploys().len(), 1);

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "stack.build.started",
                "stack.build.success",
                "stack.synth.success",
                "stack.deploy.started",
                "stack.deployed"
            ]
        );

        // Same templates again: nothing to deploy
        stack.file_changed();
        settle(&mut rx, StackState::Idle(IdleReason::Unchanged)).await;
        assert_eq!(toolchain.synths(), 2);
    }

    #[tokio::test]
    async fn test_actor_restarts_on_change_mid_build() {
        let out = TempDir::new().unwrap();
        write_assembly(out.path(), "{}");
        let toolchain = Arc::new(MockStackToolchain::new(out.path()));
        let stack = StackBuilder::spawn(toolchain.clone(), EventBus::new());
        let mut rx = stack.watch();

        toolchain.gate.close();
        stack.file_changed();
        settle(&mut rx, StackState::Building).await;
        stack.file_changed();
        stack.file_changed();
        rx.wait_for(|s| s.dirty).await.unwrap();
        toolchain.gate.open();

        settle(&mut rx, StackState::Deployable).await;
        assert_eq!(toolchain.builds(), 2);
        assert_eq!(toolchain.synths(), 1);
    }

    #[tokio::test]
    async fn test_actor_invalid_assembly_fails_synth() {
        let out = TempDir::new().unwrap();
        let toolchain = Arc::new(MockStackToolchain::new(out.path()));
        let stack = StackBuilder::spawn(toolchain, EventBus::new());
        let mut rx = stack.watch();

        stack.file_changed();
        settle(&mut rx, StackState::Failed(FailedStage::Synth)).await;
        assert_eq!(stack.snapshot().errors.len(), 1);
    }
}
