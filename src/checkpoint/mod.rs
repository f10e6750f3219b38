//! Checkpoint store
//!
//! Holds suspended session state between `run` and `resume`. Two
//! interchangeable implementations: an in-process map for tests and short
//! sessions, and a file-per-session JSON store written via temp-file plus
//! rename so a crash can never leave a half-written checkpoint. Saves are
//! serialized per session id; different sessions never contend.

use crate::engine::state::ReactState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, session_id: &str, state: &ReactState) -> Result<()>;
    async fn load(&self, session_id: &str) -> Result<Option<ReactState>>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Volatile store. State is lost on process exit.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: RwLock<HashMap<String, ReactState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, session_id: &str, state: &ReactState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ReactState>> {
        Ok(self.states.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.states.write().await.remove(session_id);
        Ok(())
    }
}

/// Durable store: `<dir>/<session_id>.json`, absent file means no pending
/// suspension. A sharded per-key lock map keeps long-suspended sessions from
/// blocking unrelated saves.
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids come from embedders; keep the file name tame.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, session_id: &str, state: &ReactState) -> Result<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed to write checkpoint {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to commit checkpoint {}", path.display()))?;
        tracing::debug!(session = session_id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ReactState>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt checkpoint {}", path.display()))?;
        Ok(Some(state))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let path = self.path_for(session_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::Mode;

    fn state(session: &str) -> ReactState {
        ReactState::new(session, "check the disk", Mode::Tui, 8)
    }

    async fn round_trip(store: &dyn CheckpointStore) {
        let mut s = state("sess-1");
        s.iteration = 3;
        store.save("sess-1", &s).await.unwrap();

        let loaded = store.load("sess-1").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-1");
        assert_eq!(loaded.iteration, 3);

        store.delete("sess-1").await.unwrap();
        assert!(store.load("sess-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        round_trip(&MemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("opspilot-ckpt-{}", uuid::Uuid::new_v4()));
        round_trip(&FileCheckpointStore::new(dir.clone())).await;
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let dir = std::env::temp_dir().join(format!("opspilot-ckpt-{}", uuid::Uuid::new_v4()));
        let store = FileCheckpointStore::new(dir.clone());
        store.delete("never-saved").await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn concurrent_saves_to_distinct_sessions() {
        let dir = std::env::temp_dir().join(format!("opspilot-ckpt-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(FileCheckpointStore::new(dir.clone()));

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("sess-{i}");
                let mut s = state(&id);
                s.iteration = i;
                store.save(&id, &s).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..16u32 {
            let id = format!("sess-{i}");
            let loaded = store.load(&id).await.unwrap().unwrap();
            assert_eq!(loaded.iteration, i);
        }
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
