// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recursive source watcher feeding both state machines.

use std::path::{Component, Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::toolchain::FileChange;

/// Directories whose contents never trigger builds.
pub const IGNORED_DIRS: &[&str] = &["node_modules", ".build", ".sst", ".tether", "target", ".git"];

/// Watches an application root and reports changed files.
///
/// Watching stops when the value is dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Start watching `root` recursively. Changes are sent on `changes`.
    pub fn start(root: &Path, changes: mpsc::UnboundedSender<FileChange>) -> Result<Self> {
        let root = root.canonicalize()?;
        let event_root = root.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            for path in event.paths {
                let Some(change) = to_change(&event_root, path) else {
                    continue;
                };
                debug!(file = %change.relative_path.display(), "File changed");
                let _ = changes.send(change);
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "Watching for file changes");
        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn to_change(root: &Path, file: PathBuf) -> Option<FileChange> {
    let relative_path = file.strip_prefix(root).ok()?.to_path_buf();
    if relative_path.as_os_str().is_empty() || is_ignored(&relative_path) {
        return None;
    }
    Some(FileChange {
        file,
        relative_path,
    })
}

/// True if any component of a relative path is an ignored directory.
pub fn is_ignored(relative_path: &Path) -> bool {
    relative_path.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_is_ignored() {
        assert!(is_ignored(Path::new("node_modules/zod/index.js")));
        assert!(is_ignored(Path::new("packages/web/node_modules/a.js")));
        assert!(is_ignored(Path::new(".tether/artifacts/a1b2c3d4/index.mjs")));
        assert!(is_ignored(Path::new(".sst/outputs.json")));
        assert!(!is_ignored(Path::new("packages/functions/src/api.ts")));
        assert!(!is_ignored(Path::new("targets.ts")));
    }

    #[test]
    fn test_to_change_relative_to_root() {
        let root = Path::new("/app");
        let change = to_change(root, PathBuf::from("/app/src/api.ts")).unwrap();
        assert_eq!(change.relative_path, PathBuf::from("src/api.ts"));
        assert_eq!(change.file, PathBuf::from("/app/src/api.ts"));

        assert!(to_change(root, PathBuf::from("/elsewhere/x.ts")).is_none());
        assert!(to_change(root, PathBuf::from("/app")).is_none());
        assert!(to_change(root, PathBuf::from("/app/node_modules/x.js")).is_none());
    }

    #[tokio::test]
    async fn test_reports_written_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = FileWatcher::start(dir.path(), tx).unwrap();

        std::fs::write(watcher.root().join("node_modules.txt"), "x").unwrap();
        std::fs::write(watcher.root().join("src/api.ts"), "export {}").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let change = rx.recv().await.unwrap();
                if change.relative_path == Path::new("src/api.ts") {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert!(change.file.ends_with("src/api.ts"));
    }
}
