//! Session memory
//!
//! Durable facts, preferences and notes that survive across sessions and
//! get injected into prompts. Bounded per scope; when full, the entry with
//! the lowest combined score is evicted.
//!
//! Recall scoring: `overlap + ln(1 + hit_count) + recency`, where `overlap`
//! is the fraction of query words found in key+value (0..=1) and `recency`
//! decays linearly to zero over 30 days. Every recall hit bumps the entry's
//! hit count.
//!
//! Persisted as one JSON document, loaded on first access; writes within
//! the debounce window coalesce into a single save.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub category: MemoryCategory,
    /// "global" or a session id.
    #[serde(default = "default_scope")]
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
}

fn default_scope() -> String {
    "global".to_string()
}

struct Inner {
    entries: HashMap<(String, String), MemoryEntry>,
    loaded: bool,
}

/// Cross-session memory store.
pub struct MemoryStore {
    path: PathBuf,
    capacity_per_scope: usize,
    debounce: std::time::Duration,
    generation: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(path: PathBuf, capacity_per_scope: usize, debounce_ms: u64) -> Self {
        Self {
            path,
            capacity_per_scope: capacity_per_scope.max(1),
            debounce: std::time::Duration::from_millis(debounce_ms),
            generation: Arc::new(AtomicU64::new(0)),
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                loaded: false,
            })),
        }
    }

    async fn ensure_loaded(&self, inner: &mut Inner) {
        if inner.loaded {
            return;
        }
        inner.loaded = true;
        if !self.path.exists() {
            return;
        }
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<Vec<MemoryEntry>>(&raw) {
                Ok(entries) => {
                    for entry in entries {
                        inner
                            .entries
                            .insert((entry.scope.clone(), entry.key.clone()), entry);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "memory file unreadable, starting fresh"),
            },
            Err(err) => tracing::warn!(error = %err, "memory file unreadable, starting fresh"),
        }
    }

    /// Store (or update) a fact in the global scope.
    pub async fn store(&self, key: &str, value: &str, category: MemoryCategory) -> Result<()> {
        self.store_scoped("global", key, value, category).await
    }

    pub async fn store_scoped(
        &self,
        scope: &str,
        key: &str,
        value: &str,
        category: MemoryCategory,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;

        let now = Utc::now();
        let slot = (scope.to_string(), key.to_string());
        match inner.entries.get_mut(&slot) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.category = category;
                entry.updated_at = now;
            }
            None => {
                inner.entries.insert(
                    slot,
                    MemoryEntry {
                        key: key.to_string(),
                        value: value.to_string(),
                        category,
                        scope: scope.to_string(),
                        created_at: now,
                        updated_at: now,
                        hit_count: 0,
                    },
                );
            }
        }

        self.enforce_capacity(&mut inner, scope);
        drop(inner);
        self.schedule_save();
        Ok(())
    }

    /// Top-k entries matching the query, best score first. Hits bump
    /// `hit_count`.
    pub async fn recall(&self, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;

        let now = Utc::now();
        let mut scored: Vec<(f64, (String, String))> = inner
            .entries
            .iter()
            .filter_map(|(slot, entry)| {
                let overlap = keyword_overlap(query, &format!("{} {}", entry.key, entry.value));
                if overlap <= 0.0 {
                    return None;
                }
                Some((score(overlap, entry, now), slot.clone()))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (_, slot) in scored {
            if let Some(entry) = inner.entries.get_mut(&slot) {
                entry.hit_count += 1;
                results.push(entry.clone());
            }
        }
        drop(inner);
        if !results.is_empty() {
            self.schedule_save();
        }
        results
    }

    pub async fn forget(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        let removed = inner.entries.remove(&("global".to_string(), key.to_string()));
        drop(inner);
        if removed.is_some() {
            self.schedule_save();
        }
        removed.is_some()
    }

    pub async fn list(&self) -> Vec<MemoryEntry> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        let mut entries: Vec<MemoryEntry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    /// Context block for prompt injection: top entries by score against the
    /// current input, rendered one per line. Empty string when nothing
    /// matches.
    pub async fn context_block(&self, query: &str, limit: usize) -> String {
        let entries = self.recall(query, limit).await;
        if entries.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Known context from previous sessions:".to_string()];
        for entry in entries {
            let tag = match entry.category {
                MemoryCategory::Fact => "fact",
                MemoryCategory::Preference => "pref",
                MemoryCategory::Note => "note",
            };
            lines.push(format!("- [{tag}] {}: {}", entry.key, entry.value));
        }
        lines.join("\n")
    }

    /// Write pending changes out immediately.
    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if !inner.loaded {
            return Ok(());
        }
        self.save_now(&inner).await
    }

    fn enforce_capacity(&self, inner: &mut Inner, scope: &str) {
        let now = Utc::now();
        loop {
            let in_scope: Vec<((String, String), f64, DateTime<Utc>)> = inner
                .entries
                .iter()
                .filter(|(slot, _)| slot.0 == scope)
                .map(|(slot, entry)| (slot.clone(), score(0.0, entry, now), entry.updated_at))
                .collect();
            if in_scope.len() <= self.capacity_per_scope {
                break;
            }
            // Lowest score goes first; ties evict the oldest entry.
            if let Some((slot, _, _)) = in_scope.into_iter().min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            }) {
                inner.entries.remove(&slot);
            } else {
                break;
            }
        }
    }

    /// Coalesce bursts of writes: each write bumps a generation counter and
    /// spawns a saver that only persists if it is still the newest.
    fn schedule_save(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation_ref = self.generation.clone();
        let inner = self.inner.clone();
        let path = self.path.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation_ref.load(Ordering::SeqCst) != generation {
                return;
            }
            let guard = inner.lock().await;
            if let Err(err) = save_entries(&path, &guard).await {
                tracing::warn!(error = %err, "failed to persist memory");
            }
        });
    }

    async fn save_now(&self, inner: &Inner) -> Result<()> {
        save_entries(&self.path, inner).await
    }
}

async fn save_entries(path: &PathBuf, inner: &Inner) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let entries: Vec<&MemoryEntry> = inner.entries.values().collect();
    let raw = serde_json::to_string_pretty(&entries)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

fn keyword_overlap(query: &str, haystack: &str) -> f64 {
    let haystack = haystack.to_lowercase();
    let words: Vec<&str> = query
        .split_whitespace()
        .filter(|w| w.chars().count() > 1)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words
        .iter()
        .filter(|w| haystack.contains(&w.to_lowercase()))
        .count();
    hits as f64 / words.len() as f64
}

fn score(overlap: f64, entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
    let age = now.signed_duration_since(entry.updated_at);
    let recency = 1.0 - (age.num_seconds() as f64 / Duration::days(30).num_seconds() as f64);
    overlap + (1.0 + entry.hit_count as f64).ln() + recency.clamp(0.0, 1.0)
}
