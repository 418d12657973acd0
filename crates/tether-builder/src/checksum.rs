// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content checksums for synthesized assemblies and function identity.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const STACK_ARTIFACT_TYPE: &str = "aws:cloudformation:stack";

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    artifacts: BTreeMap<String, ManifestArtifact>,
}

#[derive(Debug, Deserialize)]
struct ManifestArtifact {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Option<ArtifactProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactProperties {
    template_file: Option<String>,
}

/// SHA-256 over the template of every stack artifact in `dir/manifest.json`,
/// hex encoded.
///
/// Artifacts are visited in key order, so the checksum only changes when a
/// template's content, or the set of stacks, changes.
pub async fn assembly_checksum(dir: &Path) -> Result<String> {
    let manifest_path = dir.join("manifest.json");
    let raw = tokio::fs::read(&manifest_path)
        .await
        .map_err(|e| invalid(dir, format!("cannot read manifest.json: {}", e)))?;
    let manifest: Manifest = serde_json::from_slice(&raw)?;

    let mut hasher = Sha256::new();
    for (name, artifact) in &manifest.artifacts {
        if artifact.kind != STACK_ARTIFACT_TYPE {
            continue;
        }
        let template = artifact
            .properties
            .as_ref()
            .and_then(|p| p.template_file.as_deref())
            .ok_or_else(|| invalid(dir, format!("stack {} has no templateFile", name)))?;
        let content = tokio::fs::read(dir.join(template)).await?;
        hasher.update(&content);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn invalid(dir: &Path, message: String) -> Error {
    Error::InvalidAssembly {
        path: dir.to_path_buf(),
        message,
    }
}

/// Stable short id for a function defined at `path`: the first 8 hex
/// characters of the SHA-256 of the normalized path.
pub fn function_id_for_path(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    let normalized = normalized.trim_start_matches("./");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..8].to_string()
}
