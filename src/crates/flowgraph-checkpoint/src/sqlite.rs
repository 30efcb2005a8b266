//! Relational checkpoint store backed by SQLite via `sqlx`
//!
//! Enabled with the `sqlite` feature. Each thread's entire history is held
//! in a single row, so one atomic upsert replaces the whole list and no
//! read-modify-write race is possible across statements:
//!
//! ```text
//! threads                              checkpoints
//! ┌─────────────┬─────────────┬────┐  ┌───────────┬─────────────────┬────────────┐
//! │ thread_name │ internal_id │rel.│  │ thread_id │ checkpoint_data │ updated_at │
//! │ (PK)        │             │    │  │ (PK)      │ JSON list, most │  RFC 3339  │
//! │             │             │    │  │           │  recent first   │            │
//! └─────────────┴─────────────┴────┘  └───────────┴─────────────────┴────────────┘
//! ```
//!
//! `threads` maps the human-readable name to the current internal id and a
//! released flag; `checkpoints` holds the serialized history keyed by
//! internal id. Every mutation runs inside one transaction: read the
//! existing list, apply push/replace, write back with
//! `INSERT .. ON CONFLICT(thread_id) DO UPDATE`, commit. A failure anywhere
//! rolls the transaction back and leaves the stored history untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! use flowgraph_checkpoint::{Checkpoint, CheckpointStore, SqliteCheckpointStore};
//! use serde_json::json;
//!
//! let store = SqliteCheckpointStore::connect("sqlite:checkpoints.db?mode=rwc").await?;
//! store.put("thread-1", None, Checkpoint::new(json!({"step": 1}))).await?;
//! let history = store.list("thread-1").await?;
//! ```

use crate::checkpoint::{Checkpoint, Tag};
use crate::config::RunConfig;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

/// SQLite-backed [`CheckpointStore`]
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Connect to a SQLite database URL and create the schema if needed
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 5).await
    }

    /// Connect with an explicit pool size.
    ///
    /// In-memory databases (`sqlite::memory:`) are per-connection, so tests
    /// against them must use a pool size of 1.
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        debug!(url = %url, "Connected to SQLite checkpoint store");

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool; the schema must already exist or
    /// [`ensure_schema`](Self::ensure_schema) must be called.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `threads` and `checkpoints` tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_name TEXT PRIMARY KEY,
                internal_id TEXT NOT NULL,
                released INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT PRIMARY KEY,
                checkpoint_data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_internal_id(&self, thread: &str) -> Result<Option<String>> {
        let row =
            sqlx::query("SELECT internal_id FROM threads WHERE thread_name = ?1 AND released = 0")
                .bind(thread)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| r.try_get::<String, _>("internal_id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn load_history(&self, internal_id: &str) -> Result<Vec<Checkpoint>> {
        let row = sqlx::query("SELECT checkpoint_data FROM checkpoints WHERE thread_id = ?1")
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.try_get("checkpoint_data")?;
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn list(&self, thread: &str) -> Result<Vec<Checkpoint>> {
        match self.active_internal_id(thread).await? {
            Some(internal_id) => self.load_history(&internal_id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn get(&self, thread: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>> {
        let history = self.list(thread).await?;
        let found = match checkpoint_id {
            Some(id) => history.into_iter().find(|cp| cp.id == id),
            None => history.into_iter().next(),
        };
        Ok(found)
    }

    #[tracing::instrument(skip(self, checkpoint), fields(thread = %thread))]
    async fn put(
        &self,
        thread: &str,
        checkpoint_id: Option<&str>,
        checkpoint: Checkpoint,
    ) -> Result<RunConfig> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT internal_id, released FROM threads WHERE thread_name = ?1")
            .bind(thread)
            .fetch_optional(&mut *tx)
            .await?;

        let internal_id = match row {
            Some(row) if row.try_get::<i64, _>("released")? == 0 => {
                row.try_get::<String, _>("internal_id")?
            }
            _ => {
                // Missing or released: issue a fresh identity for this name.
                let fresh = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO threads (thread_name, internal_id, released)
                     VALUES (?1, ?2, 0)
                     ON CONFLICT(thread_name) DO UPDATE SET
                         internal_id = excluded.internal_id,
                         released = 0",
                )
                .bind(thread)
                .bind(&fresh)
                .execute(&mut *tx)
                .await?;
                fresh
            }
        };

        let row = sqlx::query("SELECT checkpoint_data FROM checkpoints WHERE thread_id = ?1")
            .bind(&internal_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut history: Vec<Checkpoint> = match row {
            Some(row) => serde_json::from_str(&row.try_get::<String, _>("checkpoint_data")?)?,
            None => Vec::new(),
        };

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

        let data = serde_json::to_string(&history)?;
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, checkpoint_data, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET
                 checkpoint_data = excluded.checkpoint_data,
                 updated_at = excluded.updated_at",
        )
        .bind(&internal_id)
        .bind(&data)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(thread = %thread, checkpoints = history.len(), "Stored checkpoint history");

        Ok(RunConfig::new(thread).with_checkpoint_id(stored_id))
    }

    async fn clear(&self, thread: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row =
            sqlx::query("SELECT internal_id FROM threads WHERE thread_name = ?1 AND released = 0")
                .bind(thread)
                .fetch_optional(&mut *tx)
                .await?;
        let internal_id = match row {
            Some(row) => row.try_get::<String, _>("internal_id")?,
            None => return Ok(false),
        };

        let deleted = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(&internal_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    #[tracing::instrument(skip(self), fields(thread = %thread))]
    async fn release(&self, thread: &str) -> Result<Tag> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT internal_id, released FROM threads WHERE thread_name = ?1")
            .bind(thread)
            .fetch_optional(&mut *tx)
            .await?;
        let internal_id = match row {
            Some(row) if row.try_get::<i64, _>("released")? == 0 => {
                row.try_get::<String, _>("internal_id")?
            }
            _ => return Ok(Tag::new(thread)),
        };

        sqlx::query("UPDATE threads SET released = 1 WHERE thread_name = ?1")
            .bind(thread)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query("SELECT checkpoint_data FROM checkpoints WHERE thread_id = ?1")
            .bind(&internal_id)
            .fetch_optional(&mut *tx)
            .await?;
        let checkpoints: Vec<Checkpoint> = match row {
            Some(row) => serde_json::from_str(&row.try_get::<String, _>("checkpoint_data")?)?,
            None => Vec::new(),
        };

        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(&internal_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Tag::with_checkpoints(thread, checkpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteCheckpointStore {
        // In-memory SQLite is per-connection; a single-connection pool keeps
        // the schema and the data on the same handle.
        SqliteCheckpointStore::connect_with("sqlite::memory:", 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let store = memory_store().await;
        let cp = Checkpoint::new(json!({"x": 1, "nested": {"y": [1, 2]}}));
        let expected = cp.clone();

        store.put("t1", None, cp).await.unwrap();
        let loaded = store.get("t1", None).await.unwrap().unwrap();
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn test_list_order_after_two_puts() {
        let store = memory_store().await;
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
    async fn test_replace_existing_checkpoint() {
        let store = memory_store().await;
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
    async fn test_replace_missing_checkpoint_rolls_back() {
        let store = memory_store().await;
        store
            .put("t1", None, Checkpoint::new(json!({"v": 1})))
            .await
            .unwrap();

        let result = store
            .put("t1", Some("missing"), Checkpoint::new(json!({"v": 2})))
            .await;
        assert!(matches!(result, Err(CheckpointError::NotFound)));

        let history = store.list("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = memory_store().await;
        store
            .put("t1", None, Checkpoint::new(json!({})))
            .await
            .unwrap();

        assert!(store.clear("t1").await.unwrap());
        assert!(store.list("t1").await.unwrap().is_empty());
        assert!(!store.clear("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_then_reissue() {
        let store = memory_store().await;
        store
            .put("t1", None, Checkpoint::new(json!({"old": true})))
            .await
            .unwrap();

        let tag = store.release("t1").await.unwrap();
        assert_eq!(tag.checkpoints.len(), 1);
        assert!(store.list("t1").await.unwrap().is_empty());

        let again = store.release("t1").await.unwrap();
        assert!(again.is_empty());

        // A put under the released name starts a fresh history.
        store
            .put("t1", None, Checkpoint::new(json!({"new": true})))
            .await
            .unwrap();
        let history = store.list("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, json!({"new": true}));
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = memory_store().await;
        store
            .put("t1", None, Checkpoint::new(json!({"a": 1})))
            .await
            .unwrap();
        store
            .put("t2", None, Checkpoint::new(json!({"b": 2})))
            .await
            .unwrap();

        store.clear("t1").await.unwrap();
        let history = store.list("t2").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, json!({"b": 2}));
    }
}
