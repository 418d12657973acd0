// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock toolchains for testing.
//!
//! Results are scripted per function or per stage, and a [`Gate`] can hold
//! builds in flight so tests can deliver changes mid-build.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use super::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open/closed barrier. Starts open.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Wait until the gate is open.
    pub async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Mock function toolchain.
#[derive(Default)]
pub struct MockFunctionToolchain {
    outputs: Mutex<HashMap<String, BuildOutput>>,
    issues: Mutex<HashMap<String, Vec<Issue>>>,
    rejected: Mutex<HashSet<PathBuf>>,
    builds: Mutex<HashMap<String, usize>>,
    checks_run: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Builds wait here before returning
    pub gate: Gate,
}

impl MockFunctionToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Artifact returned for a function unless an output is scripted.
    pub fn default_artifact(function_id: &str) -> FunctionArtifact {
        FunctionArtifact {
            artifact_path: PathBuf::from(format!(".tether/artifacts/{}", function_id)),
            handler: "index.handler".to_string(),
        }
    }

    /// Script the output of every following build of a function.
    pub fn set_output(&self, function_id: &str, output: BuildOutput) {
        lock(&self.outputs).insert(function_id.to_string(), output);
    }

    /// Script the issues a named check reports.
    pub fn set_issues(&self, check: &str, issues: Vec<Issue>) {
        lock(&self.issues).insert(check.to_string(), issues);
    }

    /// Make the relevance predicate refuse a relative path.
    pub fn reject(&self, relative_path: impl Into<PathBuf>) {
        lock(&self.rejected).insert(relative_path.into());
    }

    /// Number of builds started for a function.
    pub fn builds(&self, function_id: &str) -> usize {
        lock(&self.builds).get(function_id).copied().unwrap_or(0)
    }

    /// `(function_id, check)` pairs in the order checks ran.
    pub fn checks_run(&self) -> Vec<(String, String)> {
        lock(&self.checks_run).clone()
    }

    /// Highest number of builds that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionToolchain for MockFunctionToolchain {
    async fn build(&self, function_id: &str, _mode: BuildMode) -> BuildOutput {
        *lock(&self.builds).entry(function_id.to_string()).or_default() += 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        self.gate.pass().await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.outputs)
            .get(function_id)
            .cloned()
            .unwrap_or_else(|| BuildOutput::Success(Self::default_artifact(function_id)))
    }

    async fn check(&self, function_id: &str, check: &str) -> Vec<Issue> {
        lock(&self.checks_run).push((function_id.to_string(), check.to_string()));
        lock(&self.issues).get(check).cloned().unwrap_or_default()
    }

    fn is_relevant(&self, _function_id: &str, change: &FileChange) -> bool {
        !lock(&self.rejected).contains(&change.relative_path)
    }
}

/// Mock stack toolchain.
///
/// `synth` returns an assembly rooted at a directory the test prepared;
/// the checksum is computed from its real contents.
pub struct MockStackToolchain {
    assembly_dir: Mutex<PathBuf>,
    build_errors: Mutex<Option<Vec<String>>>,
    synth_errors: Mutex<Option<Vec<String>>>,
    deploy_results: Mutex<BTreeMap<String, StackDeployResult>>,
    builds: AtomicUsize,
    synths: AtomicUsize,
    deploys: Mutex<Vec<Assembly>>,
    /// Builds wait here before returning
    pub gate: Gate,
}

impl MockStackToolchain {
    pub fn new(assembly_dir: impl Into<PathBuf>) -> Self {
        let mut deploy_results = BTreeMap::new();
        deploy_results.insert("app-dev-api".to_string(), StackDeployResult::succeeded());
        Self {
            assembly_dir: Mutex::new(assembly_dir.into()),
            build_errors: Mutex::new(None),
            synth_errors: Mutex::new(None),
            deploy_results: Mutex::new(deploy_results),
            builds: AtomicUsize::new(0),
            synths: AtomicUsize::new(0),
            deploys: Mutex::new(Vec::new()),
            gate: Gate::new(),
        }
    }

    pub fn set_assembly_dir(&self, dir: impl Into<PathBuf>) {
        *lock(&self.assembly_dir) = dir.into();
    }

    /// Make builds fail with these errors; `None` restores success.
    pub fn fail_build(&self, errors: Option<Vec<String>>) {
        *lock(&self.build_errors) = errors;
    }

    /// Make synths fail with these errors; `None` restores success.
    pub fn fail_synth(&self, errors: Option<Vec<String>>) {
        *lock(&self.synth_errors) = errors;
    }

    pub fn set_deploy_results(&self, results: BTreeMap<String, StackDeployResult>) {
        *lock(&self.deploy_results) = results;
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn synths(&self) -> usize {
        self.synths.load(Ordering::SeqCst)
    }

    /// Assemblies passed to `deploy`, in order.
    pub fn deploys(&self) -> Vec<Assembly> {
        lock(&self.deploys).clone()
    }
}

#[async_trait]
impl StackToolchain for MockStackToolchain {
    async fn build(&self) -> Result<(), Vec<String>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        match lock(&self.build_errors).clone() {
            Some(errors) => Err(errors),
            None => Ok(()),
        }
    }

    async fn synth(&self) -> Result<Assembly, Vec<String>> {
        self.synths.fetch_add(1, Ordering::SeqCst);
        if let Some(errors) = lock(&self.synth_errors).clone() {
            return Err(errors);
        }
        Ok(Assembly {
            dir: lock(&self.assembly_dir).clone(),
        })
    }

    async fn deploy(&self, assembly: &Assembly) -> BTreeMap<String, StackDeployResult> {
        lock(&self.deploys).push(assembly.clone());
        lock(&self.deploy_results).clone()
    }
}
