// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Toolchain manifest (`tether.json`).
//!
//! ```json
//! {
//!   "functions": [
//!     {
//!       "source": "functions/api/index.ts",
//!       "handler": "index.handler",
//!       "build": ["npx", "esbuild", "functions/api/index.ts", "--bundle", "--outdir=.tether/api"],
//!       "artifact": ".tether/api",
//!       "worker": ["node", "/opt/runtime/index.mjs"],
//!       "watch": ["functions/api/**", "lib/**"],
//!       "checks": { "tsc": ["npx", "tsc", "--noEmit"] }
//!     }
//!   ],
//!   "stack": {
//!     "build": ["npm", "run", "build:infra"],
//!     "synth": ["npx", "cdk", "synth", "--output", ".tether/cdk.out"],
//!     "assembly": ".tether/cdk.out",
//!     "deploy": ["./scripts/deploy.sh"]
//!   }
//! }
//! ```
//!
//! Paths are relative to the directory holding the manifest. A function
//! without an `id` is identified by the hash of its `source` path.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use tether_builder::function_id_for_path;

/// Manifest errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// One function: how to build it, run it and when to rebuild it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FunctionEntry {
    #[serde(default)]
    pub id: Option<String>,
    /// Handler source file
    pub source: PathBuf,
    /// Handler entry, exposed to workers as `_HANDLER`
    pub handler: String,
    pub build: Vec<String>,
    /// Build output directory the worker runs in
    pub artifact: PathBuf,
    /// Worker command line
    pub worker: Vec<String>,
    /// Globs relative to the manifest directory; defaults to the source's directory
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub checks: BTreeMap<String, Vec<String>>,
}

impl FunctionEntry {
    pub fn function_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| function_id_for_path(&self.source))
    }

    /// Watch globs, falling back to everything below the source's directory.
    pub fn watch_patterns(&self) -> Vec<String> {
        if !self.watch.is_empty() {
            return self.watch.clone();
        }
        match self.source.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                vec![format!("{}/**", dir.to_string_lossy())]
            }
            _ => vec![self.source.to_string_lossy().into_owned()],
        }
    }
}

/// Application stacks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StackEntry {
    pub build: Vec<String>,
    pub synth: Vec<String>,
    /// Directory the synth command writes the cloud assembly to
    pub assembly: PathBuf,
    /// Prints `{stackName: {status, outputs, errors}}` as JSON on stdout
    pub deploy: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub functions: Vec<FunctionEntry>,
    #[serde(default)]
    pub stack: Option<StackEntry>,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&raw)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut ids = HashSet::new();
        for function in &self.functions {
            let id = function.function_id();
            if !ids.insert(id.clone()) {
                return Err(ManifestError::Invalid(format!("duplicate function id {}", id)));
            }
            if function.build.is_empty() || function.worker.is_empty() {
                return Err(ManifestError::Invalid(format!(
                    "function {} needs build and worker commands",
                    id
                )));
            }
            if let Some((name, _)) = function.checks.iter().find(|(_, cmd)| cmd.is_empty()) {
                return Err(ManifestError::Invalid(format!(
                    "check {} of function {} has no command",
                    name, id
                )));
            }
        }
        if let Some(stack) = &self.stack
            && (stack.build.is_empty() || stack.synth.is_empty() || stack.deploy.is_empty())
        {
            return Err(ManifestError::Invalid(
                "stack needs build, synth and deploy commands".to_string(),
            ));
        }
        Ok(())
    }
}
