// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manifest-driven toolchain running shell commands.
//!
//! Every command runs in the manifest directory. A non-zero exit is a build
//! failure or a check finding; the command's output lines become the
//! reported errors.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use tether_builder::{
    Assembly, BuildMode, BuildOutput, FunctionArtifact, FunctionSpec, FunctionToolchain, Issue,
    StackDeployResult, StackToolchain,
};

use crate::manifest::{FunctionEntry, Manifest, StackEntry};

/// Most output lines reported per failure.
const MAX_REPORTED_LINES: usize = 50;

/// Stack name used when deploy output is not a per-stack result map.
const DEFAULT_STACK: &str = "app";

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
    status: String,
}

impl CommandOutput {
    /// Output lines worth showing, stderr first.
    fn lines(&self) -> Vec<String> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<String> = source
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .take(MAX_REPORTED_LINES)
            .map(String::from)
            .collect();
        if lines.is_empty() {
            vec![format!("command exited with {}", self.status)]
        } else {
            lines
        }
    }
}

async fn run(root: &Path, command: &[String], env: &[(&str, String)]) -> CommandOutput {
    let Some((program, args)) = command.split_first() else {
        return CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "empty command".to_string(),
            status: "no status".to_string(),
        };
    };

    debug!(program = %program, ?args, "Running command");
    let output = Command::new(program)
        .args(args)
        .current_dir(root)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.to_string(),
        },
        Err(e) => {
            warn!(program = %program, error = %e, "Command failed to start");
            CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("{}: {}", program, e),
                status: "no status".to_string(),
            }
        }
    }
}

/// Toolchain backed by the commands of a [`Manifest`].
pub struct CommandToolchain {
    root: PathBuf,
    functions: HashMap<String, FunctionEntry>,
    stack: Option<StackEntry>,
}

impl CommandToolchain {
    /// `root` is the directory relative paths in the manifest resolve against.
    pub fn new(root: impl Into<PathBuf>, manifest: Manifest) -> Self {
        let functions = manifest
            .functions
            .into_iter()
            .map(|f| (f.function_id(), f))
            .collect();
        Self {
            root: root.into(),
            functions,
            stack: manifest.stack,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Builder specs for every function, keeping only enabled checks.
    pub fn function_specs(
        &self,
        check_enabled: impl Fn(&str) -> bool,
    ) -> tether_builder::Result<Vec<FunctionSpec>> {
        let mut specs = Vec::with_capacity(self.functions.len());
        for (id, entry) in &self.functions {
            let patterns = entry.watch_patterns();
            let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
            let checks = entry
                .checks
                .keys()
                .filter(|name| check_enabled(name))
                .cloned()
                .collect();
            specs.push(FunctionSpec::new(id.clone(), &patterns)?.with_checks(checks));
        }
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(specs)
    }

    /// Worker command line of a function.
    pub fn worker_command(&self, function_id: &str) -> Option<Vec<String>> {
        self.functions.get(function_id).map(|f| f.worker.clone())
    }
}

#[async_trait]
impl FunctionToolchain for CommandToolchain {
    async fn build(&self, function_id: &str, mode: BuildMode) -> BuildOutput {
        let Some(entry) = self.functions.get(function_id) else {
            return BuildOutput::Error {
                errors: vec![format!("unknown function {}", function_id)],
            };
        };
        let mode = match mode {
            BuildMode::Dev => "dev",
            BuildMode::Deploy => "deploy",
        };
        let env = [
            ("TETHER_FUNCTION_ID", function_id.to_string()),
            ("TETHER_BUILD_MODE", mode.to_string()),
        ];

        let output = run(&self.root, &entry.build, &env).await;
        if output.success {
            BuildOutput::Success(FunctionArtifact {
                artifact_path: self.root.join(&entry.artifact),
                handler: entry.handler.clone(),
            })
        } else {
            BuildOutput::Error {
                errors: output.lines(),
            }
        }
    }

    async fn check(&self, function_id: &str, check: &str) -> Vec<Issue> {
        let Some(command) = self
            .functions
            .get(function_id)
            .and_then(|f| f.checks.get(check))
        else {
            return vec![Issue::new(format!("unknown check {}", check))];
        };
        let env = [("TETHER_FUNCTION_ID", function_id.to_string())];
        let output = run(&self.root, command, &env).await;
        if output.success {
            Vec::new()
        } else {
            output.lines().into_iter().map(Issue::new).collect()
        }
    }
}

#[async_trait]
impl StackToolchain for CommandToolchain {
    async fn build(&self) -> Result<(), Vec<String>> {
        let Some(stack) = &self.stack else {
            return Err(vec!["no stack in manifest".to_string()]);
        };
        let output = run(&self.root, &stack.build, &[]).await;
        if output.success {
            Ok(())
        } else {
            Err(output.lines())
        }
    }

    async fn synth(&self) -> Result<Assembly, Vec<String>> {
        let Some(stack) = &self.stack else {
            return Err(vec!["no stack in manifest".to_string()]);
        };
        let dir = self.root.join(&stack.assembly);
        let env = [("TETHER_ASSEMBLY_DIR", dir.to_string_lossy().into_owned())];
        let output = run(&self.root, &stack.synth, &env).await;
        if output.success {
            Ok(Assembly { dir })
        } else {
            Err(output.lines())
        }
    }

    async fn deploy(&self, assembly: &Assembly) -> BTreeMap<String, StackDeployResult> {
        let mut results = BTreeMap::new();
        let Some(stack) = &self.stack else {
            results.insert(
                DEFAULT_STACK.to_string(),
                StackDeployResult::failed(vec!["no stack in manifest".to_string()]),
            );
            return results;
        };

        let env = [(
            "TETHER_ASSEMBLY_DIR",
            assembly.dir.to_string_lossy().into_owned(),
        )];
        let output = run(&self.root, &stack.deploy, &env).await;
        if !output.success {
            results.insert(
                DEFAULT_STACK.to_string(),
                StackDeployResult::failed(output.lines()),
            );
            return results;
        }

        match serde_json::from_str::<BTreeMap<String, StackDeployResult>>(output.stdout.trim()) {
            Ok(stacks) => stacks,
            Err(_) => {
                debug!("Deploy output is not a stack result map");
                results.insert(DEFAULT_STACK.to_string(), StackDeployResult::succeeded());
                results
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_builder::DeployStatus;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn toolchain(root: &Path, build: &str, check: &str) -> CommandToolchain {
        let manifest = Manifest {
            functions: vec![FunctionEntry {
                id: Some("api".to_string()),
                source: PathBuf::from("functions/api/index.js"),
                handler: "index.handler".to_string(),
                build: sh(build),
                artifact: PathBuf::from("dist/api"),
                worker: vec!["node".to_string()],
                watch: Vec::new(),
                checks: [("lint".to_string(), sh(check))].into_iter().collect(),
            }],
            stack: Some(StackEntry {
                build: sh("true"),
                synth: sh("mkdir -p \"$TETHER_ASSEMBLY_DIR\""),
                assembly: PathBuf::from("cdk.out"),
                deploy: sh(r#"echo '{"app-dev-api":{"status":"succeeded","outputs":{"Url":"https://x"}}}'"#),
            }),
        };
        CommandToolchain::new(root, manifest)
    }

    #[tokio::test]
    async fn test_build_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let ok = toolchain(dir.path(), "test \"$TETHER_BUILD_MODE\" = dev", "true");
        assert_eq!(
            FunctionToolchain::build(&ok, "api", BuildMode::Dev).await,
            BuildOutput::Success(FunctionArtifact {
                artifact_path: dir.path().join("dist/api"),
                handler: "index.handler".to_string(),
            })
        );

        let failing = toolchain(dir.path(), "echo 'error TS1005' >&2; exit 2", "true");
        assert_eq!(
            FunctionToolchain::build(&failing, "api", BuildMode::Dev).await,
            BuildOutput::Error {
                errors: vec!["error TS1005".to_string()]
            }
        );

        let silent = toolchain(dir.path(), "exit 3", "true");
        match FunctionToolchain::build(&silent, "api", BuildMode::Dev).await {
            BuildOutput::Error { errors } => assert!(errors[0].starts_with("command exited with")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "true", "true");
        assert!(matches!(
            FunctionToolchain::build(&tc, "nope", BuildMode::Dev).await,
            BuildOutput::Error { .. }
        ));
        assert!(tc.worker_command("nope").is_none());
        assert_eq!(tc.worker_command("api"), Some(vec!["node".to_string()]));
    }

    #[tokio::test]
    async fn test_check_reports_output_lines() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "true", "echo 'a.js:1 no-unused-vars'; echo; exit 1");
        assert_eq!(
            tc.check("api", "lint").await,
            vec![Issue::new("a.js:1 no-unused-vars")]
        );

        let clean = toolchain(dir.path(), "true", "echo fine");
        assert!(clean.check("api", "lint").await.is_empty());
    }

    #[tokio::test]
    async fn test_stack_commands() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "true", "true");
        StackToolchain::build(&tc).await.unwrap();
        let assembly = tc.synth().await.unwrap();
        assert_eq!(assembly.dir, dir.path().join("cdk.out"));
        assert!(assembly.dir.is_dir());

        let results = tc.deploy(&assembly).await;
        assert_eq!(results["app-dev-api"].status, DeployStatus::Succeeded);
        assert_eq!(results["app-dev-api"].outputs["Url"], "https://x");
    }

    #[test]
    fn test_function_specs_filter_checks() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "true", "true");
        let all = tc.function_specs(|_| true).unwrap();
        assert_eq!(all[0].checks, vec!["lint".to_string()]);
        let none = tc.function_specs(|name| name == "tsc").unwrap();
        assert!(none[0].checks.is_empty());
        assert!(tc.has_stack());
    }
}
