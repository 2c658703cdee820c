//! Atomic JSON snapshots with rotated backups.
//!
//! Every snapshot write goes to a temporary sibling first, is fsynced,
//! and then renamed over the target, so a crash mid-write never corrupts
//! the current file. Before the rename, existing copies rotate through
//! integer-suffixed backups (`metrics.json.1` is the newest). Readers
//! tolerate absent files and fall back through the backups when the main
//! file fails to parse.

use crate::models::error::OrchestratorError;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// One snapshot file with its backup rotation.
///
/// # Examples
///
/// ```rust,no_run
/// use corral::services::persistence::SnapshotStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SnapshotStore::new("./state/metrics.json", 3);
/// store.write(&serde_json::json!({ "schema": 1 })).await?;
///
/// let restored: Option<serde_json::Value> = store.read().await?;
/// assert!(restored.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    max_backups: usize,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the snapshot with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] when serialization or
    /// any filesystem step fails. The previous snapshot stays intact in
    /// that case.
    pub async fn write<T: Serialize>(&self, value: &T) -> Result<(), OrchestratorError> {
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|e| OrchestratorError::Persistence(format!("serialize failed: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    OrchestratorError::Persistence(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let tmp = self.sibling("tmp");
        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            OrchestratorError::Persistence(format!("cannot create {}: {}", tmp.display(), e))
        })?;
        file.write_all(&payload).await.map_err(|e| {
            OrchestratorError::Persistence(format!("cannot write {}: {}", tmp.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            OrchestratorError::Persistence(format!("cannot sync {}: {}", tmp.display(), e))
        })?;
        drop(file);

        self.rotate_backups().await;

        fs::rename(&tmp, &self.path).await.map_err(|e| {
            OrchestratorError::Persistence(format!(
                "cannot rename {} to {}: {}",
                tmp.display(),
                self.path.display(),
                e
            ))
        })?;

        debug!("Wrote snapshot {}", self.path.display());
        Ok(())
    }

    /// Reads the snapshot, falling back through backups on parse failure.
    ///
    /// Returns `Ok(None)` when neither the file nor any backup exists,
    /// which callers treat as a fresh start.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Option<T>, OrchestratorError> {
        match fs::read(&self.path).await {
            Ok(content) => match serde_json::from_slice(&content) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    warn!(
                        "Snapshot {} is malformed ({}), trying backups",
                        self.path.display(),
                        e
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OrchestratorError::Persistence(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }

        for i in 1..=self.max_backups {
            let backup = self.sibling(&i.to_string());
            match fs::read(&backup).await {
                Ok(content) => match serde_json::from_slice(&content) {
                    Ok(value) => {
                        warn!("Recovered snapshot from backup {}", backup.display());
                        return Ok(Some(value));
                    }
                    Err(e) => {
                        warn!("Backup {} is malformed ({})", backup.display(), e);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Cannot read backup {}: {}", backup.display(), e);
                }
            }
        }

        Ok(None)
    }

    /// Shifts `file.N` to `file.N+1` and the current file to `file.1`.
    async fn rotate_backups(&self) {
        if self.max_backups == 0 {
            return;
        }

        for i in (1..self.max_backups).rev() {
            let from = self.sibling(&i.to_string());
            let to = self.sibling(&(i + 1).to_string());
            if fs::metadata(&from).await.is_ok() {
                if let Err(e) = fs::rename(&from, &to).await {
                    warn!("Backup rotation {} failed: {}", from.display(), e);
                }
            }
        }

        if fs::metadata(&self.path).await.is_ok() {
            let first = self.sibling("1");
            if let Err(e) = fs::rename(&self.path, &first).await {
                warn!("Backup rotation {} failed: {}", self.path.display(), e);
            }
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }
}
