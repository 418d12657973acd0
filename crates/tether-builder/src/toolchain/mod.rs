// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator interfaces for building functions and stacks.
//!
//! The state machines only decide *when* to build, check, synth and deploy.
//! *How* is delegated to a [`FunctionToolchain`] and a [`StackToolchain`].

mod mock;

pub use mock::{Gate, MockFunctionToolchain, MockStackToolchain};

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Target of a function build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Local development build served by workers
    Dev,
    /// Build for deployment
    Deploy,
}

/// Built function code, ready to be started by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionArtifact {
    pub artifact_path: PathBuf,
    #[serde(rename = "handlerEntry")]
    pub handler: String,
}

/// Outcome of [`FunctionToolchain::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildOutput {
    Success(FunctionArtifact),
    Error { errors: Vec<String> },
}

/// Diagnostic produced by a build or a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: impl Into<PathBuf>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

/// A changed file reported by the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file: PathBuf,
    pub relative_path: PathBuf,
}

impl FileChange {
    pub fn new(file: impl Into<PathBuf>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            relative_path: relative_path.into(),
        }
    }
}

/// Builds and validates function code.
#[async_trait]
pub trait FunctionToolchain: Send + Sync {
    /// Build one function. Toolchain failures are reported as
    /// [`BuildOutput::Error`], never as panics.
    async fn build(&self, function_id: &str, mode: BuildMode) -> BuildOutput;

    /// Secondary validation (type checking, linting) of a built function.
    async fn check(&self, function_id: &str, check: &str) -> Vec<Issue>;

    /// Custom relevance predicate, consulted after the watch patterns matched.
    fn is_relevant(&self, _function_id: &str, _change: &FileChange) -> bool {
        true
    }
}

/// Synthesized cloud assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    /// Directory containing `manifest.json` and the stack templates
    pub dir: PathBuf,
}

/// Per-stack deploy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Result of deploying one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDeployResult {
    pub status: DeployStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl StackDeployResult {
    pub fn succeeded() -> Self {
        Self {
            status: DeployStatus::Succeeded,
            outputs: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            status: DeployStatus::Failed,
            outputs: BTreeMap::new(),
            errors,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == DeployStatus::Failed || !self.errors.is_empty()
    }
}

/// Builds, synthesizes and deploys the application's stacks.
#[async_trait]
pub trait StackToolchain: Send + Sync {
    async fn build(&self) -> Result<(), Vec<String>>;

    async fn synth(&self) -> Result<Assembly, Vec<String>>;

    /// Deploy every stack of the assembly, keyed by stack name.
    async fn deploy(&self, assembly: &Assembly) -> BTreeMap<String, StackDeployResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_output_wire_shape() {
        let success = BuildOutput::Success(FunctionArtifact {
            artifact_path: PathBuf::from(".tether/artifacts/a1b2c3d4"),
            handler: "index.handler".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({
                "type": "success",
                "artifactPath": ".tether/artifacts/a1b2c3d4",
                "handlerEntry": "index.handler"
            })
        );

        let error: BuildOutput =
            serde_json::from_value(json!({"type": "error", "errors": ["boom"]})).unwrap();
        assert_eq!(
            error,
            BuildOutput::Error {
                errors: vec!["boom".to_string()]
            }
        );
    }

    #[test]
    fn test_deploy_result_failure() {
        assert!(!StackDeployResult::succeeded().is_failure());
        assert!(StackDeployResult::failed(vec!["rollback".to_string()]).is_failure());

        let skipped_with_errors = StackDeployResult {
            status: DeployStatus::Skipped,
            outputs: BTreeMap::new(),
            errors: vec!["drift".to_string()],
        };
        assert!(skipped_with_errors.is_failure());
    }

    #[test]
    fn test_issue_omits_missing_location() {
        assert_eq!(
            serde_json::to_value(Issue::new("unused variable")).unwrap(),
            json!({"message": "unused variable"})
        );
        assert_eq!(
            serde_json::to_value(Issue::new("bad").at("src/index.ts", 3)).unwrap(),
            json!({"message": "bad", "file": "src/index.ts", "line": 3})
        );
    }
}
