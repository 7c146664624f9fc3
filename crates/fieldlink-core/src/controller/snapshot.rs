// ── Snapshot file cache ──
//
// Per-controller JSON file used to rehydrate discovered state across
// restarts. Reads never fail the caller; writes go through a temporary
// file so a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    name: String,
    path: PathBuf,
}

impl SnapshotCache {
    /// Snapshot for controller `name` at `<dir>/<NAME>.json`.
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        let path = dir.as_ref().join(format!("{}.json", name.to_uppercase()));
        Self {
            name: name.to_owned(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot. A missing or unreadable file yields `None`.
    pub async fn read(&self) -> Option<serde_json::Value> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(controller = %self.name, path = %self.path.display(), "no snapshot file");
                return None;
            }
            Err(e) => {
                warn!(controller = %self.name, error = %e, "unable to read snapshot file");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(controller = %self.name, error = %e, "snapshot file is not valid JSON, ignoring");
                None
            }
        }
    }

    pub async fn write(&self, snapshot: &serde_json::Value) -> Result<(), CoreError> {
        let err = |reason: String| CoreError::Snapshot {
            controller: self.name.clone(),
            reason,
        };

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| err(e.to_string()))?;
        }
        let body = serde_json::to_vec(snapshot).map_err(|e| err(e.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, body)
            .await
            .map_err(|e| err(e.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| err(e.to_string()))?;
        debug!(controller = %self.name, path = %self.path.display(), "snapshot written");
        Ok(())
    }
}
