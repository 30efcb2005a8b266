//! In-memory checkpoint store
//!
//! Reference implementation of [`CheckpointStore`] backed by process-local
//! maps behind a `tokio::sync::RwLock`. All data is lost on restart; use it
//! for development, unit tests, and single-process prototypes, then swap in
//! a durable backend without touching application code.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowgraph_checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryCheckpointStore::new();
//!
//!     store.put("thread-1", None, Checkpoint::new(json!({"step": 1}))).await?;
//!     store.put("thread-1", None, Checkpoint::new(json!({"step": 2}))).await?;
//!
//!     let history = store.list("thread-1").await?;
//!     assert_eq!(history.len(), 2);
//!     assert_eq!(history[0].state["step"], json!(2)); // most recent first
//!
//!     Ok(())
//! }
//! ```
//!
//! # Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | `put` (push) | O(n) front insert |
//! | `put` (replace) | O(n) scan |
//! | `get` / `list` | O(n) clone of the thread's history |
//! | `clear` / `release` | O(1) map removal |
//!
//! Reads take the lock shared, writes take it exclusive. Writers to
//! different threads contend on the single lock; that is acceptable for a
//! process-local store and is exactly what the durable backends avoid with
//! per-thread locking.

use crate::checkpoint::{Checkpoint, Tag};
use crate::config::RunConfig;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ThreadMeta {
    internal_id: String,
    released: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    /// thread name -> current identity
    threads: HashMap<String, ThreadMeta>,
    /// internal thread id -> history, most recent first
    content: HashMap<String, Vec<Checkpoint>>,
}

impl MemoryInner {
    fn active_internal_id(&self, thread: &str) -> Option<&str> {
        self.threads
            .get(thread)
            .filter(|meta| !meta.released)
            .map(|meta| meta.internal_id.as_str())
    }
}

/// Process-local [`CheckpointStore`] for development and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of thread names ever issued an identity (released included)
    pub async fn thread_count(&self) -> usize {
        self.inner.read().await.threads.len()
    }

    /// Total number of stored checkpoints across all live histories
    pub async fn checkpoint_count(&self) -> usize {
        self.inner
            .read()
            .await
            .content
            .values()
            .map(|history| history.len())
            .sum()
    }

    /// Current internal id for a thread name, if the thread is active
    pub async fn internal_thread_id(&self, thread: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .active_internal_id(thread)
            .map(str::to_string)
    }

    /// Drop all threads and histories (useful between tests)
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.threads.clear();
        inner.content.clear();
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn list(&self, thread: &str) -> Result<Vec<Checkpoint>> {
        let inner = self.inner.read().await;
        let history = inner
            .active_internal_id(thread)
            .and_then(|id| inner.content.get(id))
            .cloned()
            .unwrap_or_default();
        Ok(history)
    }

    async fn get(&self, thread: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>> {
        let inner = self.inner.read().await;
        let history = match inner
            .active_internal_id(thread)
            .and_then(|id| inner.content.get(id))
        {
            Some(history) => history,
            None => return Ok(None),
        };

        let found = match checkpoint_id {
            Some(id) => history.iter().find(|cp| cp.id == id),
            None => history.first(),
        };
        Ok(found.cloned())
    }

    async fn put(
        &self,
        thread: &str,
        checkpoint_id: Option<&str>,
        checkpoint: Checkpoint,
    ) -> Result<RunConfig> {
        let mut inner = self.inner.write().await;

        let needs_identity = inner
            .threads
            .get(thread)
            .map(|meta| meta.released)
            .unwrap_or(true);
        if needs_identity {
            inner.threads.insert(
                thread.to_string(),
                ThreadMeta {
                    internal_id: Uuid::new_v4().to_string(),
                    released: false,
                },
            );
        }
        let internal_id = inner.threads[thread].internal_id.clone();
        let history = inner.content.entry(internal_id).or_default();

        let stored_id = match checkpoint_id {
            Some(id) => {
                let slot = history
                    .iter_mut()
                    .find(|cp| cp.id == id)
                    .ok_or(CheckpointError::NotFound)?;
                *slot = checkpoint.with_id(id);
                id.to_string()
            }
            None => {
                let id = checkpoint.id.clone();
                history.insert(0, checkpoint);
                id
            }
        };

        Ok(RunConfig::new(thread).with_checkpoint_id(stored_id))
    }

    async fn clear(&self, thread: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let internal_id = match inner.active_internal_id(thread) {
            Some(id) => id.to_string(),
            None => return Ok(false),
        };
        Ok(inner.content.remove(&internal_id).is_some())
    }

    async fn release(&self, thread: &str) -> Result<Tag> {
        let mut inner = self.inner.write().await;
        let internal_id = match inner.threads.get_mut(thread) {
            Some(meta) if !meta.released => {
                meta.released = true;
                meta.internal_id.clone()
            }
            _ => return Ok(Tag::new(thread)),
        };
        let checkpoints = inner.content.remove(&internal_id).unwrap_or_default();
        Ok(Tag::with_checkpoints(thread, checkpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get_latest() {
        let store = MemoryCheckpointStore::new();
        let cp = Checkpoint::new(json!({"x": 1}));
        let cp_id = cp.id.clone();

        let config = store.put("t1", None, cp).await.unwrap();
        assert_eq!(config.thread_id.as_deref(), Some("t1"));
        assert_eq!(config.checkpoint_id.as_deref(), Some(cp_id.as_str()));

        let latest = store.get("t1", None).await.unwrap().unwrap();
        assert_eq!(latest.id, cp_id);
        assert_eq!(latest.state, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        let store = MemoryCheckpointStore::new();
        let cp1 = Checkpoint::new(json!({"step": 1}));
        let cp2 = Checkpoint::new(json!({"step": 2}));
        let (id1, id2) = (cp1.id.clone(), cp2.id.clone());

        store.put("t1", None, cp1).await.unwrap();
        store.put("t1", None, cp2).await.unwrap();

        let history = store.list("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, id2);
        assert_eq!(history[1].id, id1);
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let store = MemoryCheckpointStore::new();
        let cp1 = Checkpoint::new(json!({"step": 1}));
        let id1 = cp1.id.clone();
        store.put("t1", None, cp1).await.unwrap();
        store
            .put("t1", None, Checkpoint::new(json!({"step": 2})))
            .await
            .unwrap();

        let found = store.get("t1", Some(&id1)).await.unwrap().unwrap();
        assert_eq!(found.state, json!({"step": 1}));
    }

    #[tokio::test]
    async fn test_replace_by_id() {
        let store = MemoryCheckpointStore::new();
        let cp = Checkpoint::new(json!({"v": 1}));
        let id = cp.id.clone();
        store.put("t1", None, cp).await.unwrap();

        store
            .put("t1", Some(&id), Checkpoint::new(json!({"v": 2})))
            .await
            .unwrap();

        let history = store.list("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].state, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_replace_missing_id_fails() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({})))
            .await
            .unwrap();

        let result = store
            .put("t1", Some("no-such-id"), Checkpoint::new(json!({})))
            .await;
        assert!(matches!(result, Err(CheckpointError::NotFound)));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({})))
            .await
            .unwrap();

        assert!(store.clear("t1").await.unwrap());
        assert!(store.list("t1").await.unwrap().is_empty());
        assert!(!store.clear("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_returns_history_and_is_idempotent() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({"step": 1})))
            .await
            .unwrap();
        store
            .put("t1", None, Checkpoint::new(json!({"step": 2})))
            .await
            .unwrap();

        let tag = store.release("t1").await.unwrap();
        assert_eq!(tag.thread_name, "t1");
        assert_eq!(tag.checkpoints.len(), 2);

        // Released threads read as empty, and a second release stays closed.
        assert!(store.list("t1").await.unwrap().is_empty());
        let again = store.release("t1").await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_put_after_release_allocates_new_identity() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({"old": true})))
            .await
            .unwrap();
        let old_internal = store.internal_thread_id("t1").await.unwrap();

        store.release("t1").await.unwrap();
        assert_eq!(store.internal_thread_id("t1").await, None);

        store
            .put("t1", None, Checkpoint::new(json!({"new": true})))
            .await
            .unwrap();
        let new_internal = store.internal_thread_id("t1").await.unwrap();
        assert_ne!(old_internal, new_internal);

        // The fresh identity starts with an empty history plus the new entry.
        let history = store.list("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, json!({"new": true}));
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({"a": 1})))
            .await
            .unwrap();
        store
            .put("t2", None, Checkpoint::new(json!({"b": 2})))
            .await
            .unwrap();

        assert_eq!(store.thread_count().await, 2);
        assert_eq!(store.list("t1").await.unwrap().len(), 1);
        assert_eq!(store.list("t2").await.unwrap().len(), 1);

        store.clear("t1").await.unwrap();
        assert_eq!(store.list("t2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_introspection_helpers() {
        let store = MemoryCheckpointStore::new();
        store
            .put("t1", None, Checkpoint::new(json!({})))
            .await
            .unwrap();
        store
            .put("t1", None, Checkpoint::new(json!({})))
            .await
            .unwrap();

        assert_eq!(store.thread_count().await, 1);
        assert_eq!(store.checkpoint_count().await, 2);

        store.reset().await;
        assert_eq!(store.thread_count().await, 0);
        assert_eq!(store.checkpoint_count().await, 0);
    }
}
