//! Change tracking and rollback
//!
//! Before a worker mutates a file, the tracker copies the current content
//! into a backup blob and hands back a change id. `rollback` restores the
//! file byte-for-byte; a file that did not exist before the change is
//! removed again. Command-kind records are audit-only and never roll back.
//!
//! Index and blobs live under `<base>/changes/` so rollback survives
//! process restarts. Records older than the retention window are pruned
//! when the tracker loads.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    FileWrite,
    FileDelete,
    FileAppend,
    FileReplace,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: String,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_path: Option<String>,
    /// Blob file name under the backups directory, when the target existed.
    #[serde(default)]
    pub backup_blob: Option<String>,
    pub rollback_available: bool,
    #[serde(default)]
    pub rolled_back: bool,
}

struct Inner {
    records: Vec<ChangeRecord>,
    loaded: bool,
}

/// Tracks reversible changes under one directory.
pub struct ChangeTracker {
    base_dir: PathBuf,
    retention: Duration,
    inner: Mutex<Inner>,
}

impl ChangeTracker {
    pub fn new(base_dir: PathBuf) -> Self {
        Self::with_retention(base_dir, 30)
    }

    pub fn with_retention(base_dir: PathBuf, retention_days: i64) -> Self {
        Self {
            base_dir,
            retention: Duration::days(retention_days),
            inner: Mutex::new(Inner {
                records: Vec::new(),
                loaded: false,
            }),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    fn blob_path(&self, blob: &str) -> PathBuf {
        self.base_dir.join(blob)
    }

    async fn ensure_loaded(&self, inner: &mut Inner) -> Result<()> {
        if inner.loaded {
            return Ok(());
        }
        inner.loaded = true;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let index = self.index_path();
        if index.exists() {
            let raw = tokio::fs::read_to_string(&index).await?;
            match serde_json::from_str::<Vec<ChangeRecord>>(&raw) {
                Ok(records) => inner.records = records,
                Err(err) => {
                    tracing::warn!(error = %err, "change index unreadable, starting fresh")
                }
            }
        }

        // Retention prune.
        let cutoff = Utc::now() - self.retention;
        let (keep, drop): (Vec<_>, Vec<_>) = inner
            .records
            .drain(..)
            .partition(|r| r.timestamp >= cutoff);
        for old in &drop {
            if let Some(blob) = &old.backup_blob {
                tokio::fs::remove_file(self.blob_path(blob)).await.ok();
            }
        }
        if !drop.is_empty() {
            tracing::info!(pruned = drop.len(), "pruned expired change records");
        }
        inner.records = keep;
        self.persist(&inner.records).await
    }

    async fn persist(&self, records: &[ChangeRecord]) -> Result<()> {
        let raw = serde_json::to_string_pretty(records)?;
        tokio::fs::write(self.index_path(), raw).await?;
        Ok(())
    }

    /// Snapshot `target` ahead of a mutation of the given kind. Returns the
    /// change id the worker should surface in its result.
    pub async fn snapshot(
        &self,
        target: &Path,
        kind: ChangeKind,
        description: &str,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;

        let change_id = Uuid::new_v4().to_string();
        let mut backup_blob = None;
        let rollback_available = kind != ChangeKind::Command;

        if rollback_available && target.exists() {
            let blob = format!("{change_id}.blob");
            tokio::fs::copy(target, self.blob_path(&blob))
                .await
                .with_context(|| format!("failed to back up {}", target.display()))?;
            backup_blob = Some(blob);
        }

        let record = ChangeRecord {
            change_id: change_id.clone(),
            kind,
            timestamp: Utc::now(),
            description: description.to_string(),
            target_path: Some(target.display().to_string()),
            backup_blob,
            rollback_available,
            rolled_back: false,
        };
        inner.records.push(record);
        self.persist(&inner.records).await?;
        Ok(change_id)
    }

    /// Record a command execution for the ledger. Never rolls back.
    pub async fn record_command(&self, command: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;

        let change_id = Uuid::new_v4().to_string();
        inner.records.push(ChangeRecord {
            change_id: change_id.clone(),
            kind: ChangeKind::Command,
            timestamp: Utc::now(),
            description: format!("command: {command}"),
            target_path: None,
            backup_blob: None,
            rollback_available: false,
            rolled_back: false,
        });
        self.persist(&inner.records).await?;
        Ok(change_id)
    }

    /// Restore the file to its pre-change content.
    pub async fn rollback(&self, change_id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;

        let record = inner
            .records
            .iter_mut()
            .find(|r| r.change_id == change_id)
            .ok_or_else(|| anyhow!("no change record with id {change_id}"))?;

        if record.rolled_back {
            anyhow::bail!("change {change_id} was already rolled back");
        }
        if record.kind == ChangeKind::Command {
            anyhow::bail!("change {change_id} is a command record; rollback is unsupported");
        }
        if !record.rollback_available {
            anyhow::bail!("change {change_id} has no rollback data");
        }

        let target = PathBuf::from(
            record
                .target_path
                .as_ref()
                .ok_or_else(|| anyhow!("change {change_id} has no target path"))?,
        );

        match &record.backup_blob {
            Some(blob) => {
                let blob_path = self.blob_path(blob);
                if !blob_path.exists() {
                    anyhow::bail!("backup blob for {change_id} is missing");
                }
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                tokio::fs::copy(&blob_path, &target).await?;
            }
            // No blob means the file did not exist before: undo = remove.
            None => {
                tokio::fs::remove_file(&target).await.ok();
            }
        }

        record.rolled_back = true;
        let description = record.description.clone();
        self.persist(&inner.records).await?;
        Ok(format!("rolled back: {description}"))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        Ok(inner.records.iter().rev().take(limit).cloned().collect())
    }

    pub async fn get(&self, change_id: &str) -> Result<Option<ChangeRecord>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        Ok(inner
            .records
            .iter()
            .find(|r| r.change_id == change_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (ChangeTracker, PathBuf) {
        let dir = std::env::temp_dir().join(format!("opspilot-changes-{}", Uuid::new_v4()));
        (ChangeTracker::new(dir.join("changes")), dir)
    }

    #[tokio::test]
    async fn rollback_restores_original_bytes() {
        let (tracker, dir) = tracker();
        let target = dir.join("app.conf");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&target, b"port = 8080\n").await.unwrap();

        let id = tracker
            .snapshot(&target, ChangeKind::FileReplace, "edit port")
            .await
            .unwrap();
        tokio::fs::write(&target, b"port = 9090\n").await.unwrap();

        tracker.rollback(&id).await.unwrap();
        let restored = tokio::fs::read(&target).await.unwrap();
        assert_eq!(restored, b"port = 8080\n");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn rollback_of_new_file_removes_it() {
        let (tracker, dir) = tracker();
        let target = dir.join("fresh.env");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let id = tracker
            .snapshot(&target, ChangeKind::FileWrite, "create env")
            .await
            .unwrap();
        tokio::fs::write(&target, b"SECRET=1\n").await.unwrap();

        tracker.rollback(&id).await.unwrap();
        assert!(!target.exists());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn command_records_never_roll_back() {
        let (tracker, dir) = tracker();
        let id = tracker.record_command("systemctl restart nginx").await.unwrap();
        let err = tracker.rollback(&id).await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn double_rollback_is_rejected() {
        let (tracker, dir) = tracker();
        let target = dir.join("f.txt");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&target, b"v1").await.unwrap();

        let id = tracker
            .snapshot(&target, ChangeKind::FileReplace, "edit")
            .await
            .unwrap();
        tracker.rollback(&id).await.unwrap();
        assert!(tracker.rollback(&id).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn index_survives_reload() {
        let (tracker, dir) = tracker();
        let target = dir.join("persist.txt");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&target, b"before").await.unwrap();
        let id = tracker
            .snapshot(&target, ChangeKind::FileReplace, "edit")
            .await
            .unwrap();
        drop(tracker);

        tokio::fs::write(&target, b"after").await.unwrap();
        let reloaded = ChangeTracker::new(dir.join("changes"));
        reloaded.rollback(&id).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"before");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
