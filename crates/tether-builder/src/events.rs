// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle events published for log and UI layers.
//!
//! Events serialize with a dotted `type` tag, for example
//! `{"type":"function.build.failed","functionId":"a1b2c3d4","errors":[...]}`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::toolchain::{Issue, StackDeployResult};

const BUS_CAPACITY: usize = 1024;

/// Build, deploy and invocation lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename = "function.build.started")]
    FunctionBuildStarted { function_id: String },
    #[serde(rename = "function.build.success")]
    FunctionBuildSuccess {
        function_id: String,
        duration_ms: i64,
        /// An earlier artifact was replaced
        rebuilt: bool,
    },
    #[serde(rename = "function.build.failed")]
    FunctionBuildFailed {
        function_id: String,
        errors: Vec<String>,
    },
    #[serde(rename = "function.checked")]
    FunctionChecked {
        function_id: String,
        issues: BTreeMap<String, Vec<Issue>>,
    },
    #[serde(rename = "function.invoked")]
    FunctionInvoked {
        function_id: String,
        worker_id: String,
        request_id: String,
    },
    #[serde(rename = "function.success")]
    FunctionSuccess {
        function_id: String,
        request_id: String,
        body: Value,
    },
    #[serde(rename = "function.error")]
    FunctionError {
        function_id: String,
        request_id: String,
        error_type: String,
        error_message: String,
    },
    #[serde(rename = "function.log")]
    FunctionLog {
        function_id: String,
        worker_id: String,
        line: String,
    },
    #[serde(rename = "stack.build.started")]
    StackBuildStarted,
    #[serde(rename = "stack.build.success")]
    StackBuildSuccess,
    #[serde(rename = "stack.build.failed")]
    StackBuildFailed { errors: Vec<String> },
    #[serde(rename = "stack.synth.success")]
    StackSynthSuccess { checksum: String },
    #[serde(rename = "stack.synth.unchanged")]
    StackSynthUnchanged { checksum: String },
    #[serde(rename = "stack.synth.failed")]
    StackSynthFailed { errors: Vec<String> },
    #[serde(rename = "stack.deploy.started")]
    StackDeployStarted { checksum: String },
    #[serde(rename = "stack.deployed")]
    StackDeployed {
        checksum: String,
        stacks: BTreeMap<String, StackDeployResult>,
    },
    #[serde(rename = "stack.deploy.failed")]
    StackDeployFailed {
        errors: Vec<String>,
        stacks: BTreeMap<String, StackDeployResult>,
    },
}

impl LifecycleEvent {
    /// Dotted event name, same as the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FunctionBuildStarted { .. } => "function.build.started",
            Self::FunctionBuildSuccess { .. } => "function.build.success",
            Self::FunctionBuildFailed { .. } => "function.build.failed",
            Self::FunctionChecked { .. } => "function.checked",
            Self::FunctionInvoked { .. } => "function.invoked",
            Self::FunctionSuccess { .. } => "function.success",
            Self::FunctionError { .. } => "function.error",
            Self::FunctionLog { .. } => "function.log",
            Self::StackBuildStarted => "stack.build.started",
            Self::StackBuildSuccess => "stack.build.success",
            Self::StackBuildFailed { .. } => "stack.build.failed",
            Self::StackSynthSuccess { .. } => "stack.synth.success",
            Self::StackSynthUnchanged { .. } => "stack.synth.unchanged",
            Self::StackSynthFailed { .. } => "stack.synth.failed",
            Self::StackDeployStarted { .. } => "stack.deploy.started",
            Self::StackDeployed { .. } => "stack.deployed",
            Self::StackDeployFailed { .. } => "stack.deploy.failed",
        }
    }
}

/// Broadcast bus for [`LifecycleEvent`]s.
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        debug!(event = event.name(), "Lifecycle event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
