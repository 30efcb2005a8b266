//! The [`CheckpointStore`] contract implemented by every storage backend
//!
//! A checkpoint store owns the durable, thread-scoped history of execution
//! snapshots. The execution engine writes through it after every committed
//! step and reads from it when a run resumes. The store outlives any single
//! run; history is removed only by explicit `clear` or `release`.
//!
//! # Operations
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | `list(thread)` | Full history, most recent first |
//! | `get(thread, id)` | One checkpoint; `None` id selects the most recent |
//! | `put(thread, id, cp)` | `id` present: replace that checkpoint (error if absent). `id` absent: push to the front |
//! | `clear(thread)` | Delete the thread's current history |
//! | `release(thread)` | Close the thread's internal identity, returning its history as a [`Tag`] |
//!
//! # Thread identity
//!
//! Callers address threads by a human-readable name. Internally each backend
//! maps that name to an internal thread id. `release` closes the current
//! mapping; the next `put` under the same name allocates a fresh internal
//! id, so "start a new session under the same display name" never resurrects
//! released history. Releasing twice is a no-op that returns an empty tag.
//!
//! # Concurrency contract
//!
//! At most one writer mutates a given thread at a time; writers to different
//! threads must never block each other. How that is achieved is up to the
//! backend (a transaction over a single row, a distributed per-thread lock,
//! an in-process `RwLock`).
//!
//! # Implementing a custom backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use flowgraph_checkpoint::{
//!     Checkpoint, CheckpointError, CheckpointStore, Result, RunConfig, Tag,
//! };
//!
//! struct PostgresCheckpointStore {
//!     pool: sqlx::PgPool,
//! }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresCheckpointStore {
//!     async fn list(&self, thread: &str) -> Result<Vec<Checkpoint>> {
//!         let row = sqlx::query("SELECT checkpoint_data FROM checkpoints WHERE thread_id = $1")
//!             .bind(thread)
//!             .fetch_optional(&self.pool)
//!             .await
//!             .map_err(|e| CheckpointError::Storage(e.to_string()))?;
//!         // ... deserialize the stored history ...
//! #       unimplemented!()
//!     }
//!
//!     // ... get / put / clear / release ...
//! }
//! ```
//!
//! # See Also
//!
//! - [`MemoryCheckpointStore`](crate::memory::MemoryCheckpointStore) - reference implementation
//! - [`SqliteCheckpointStore`](crate::sqlite::SqliteCheckpointStore) - relational backend (`sqlite` feature)
//! - [`RedisCheckpointStore`](crate::redis::RedisCheckpointStore) - cache-store backend (`redis` feature)

use crate::checkpoint::{Checkpoint, Tag};
use crate::config::RunConfig;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::pin::Pin;

/// Stream of checkpoints, most recent first
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<Checkpoint>> + Send + 'static>>;

/// Durable, thread-scoped checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Full history for a thread, most recent first.
    ///
    /// Unknown or released threads yield an empty collection.
    async fn list(&self, thread: &str) -> Result<Vec<Checkpoint>>;

    /// One checkpoint by id, or the most recent when `checkpoint_id` is `None`.
    async fn get(&self, thread: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>>;

    /// Store a checkpoint.
    ///
    /// With `checkpoint_id` present the checkpoint holding that id is
    /// replaced in place (the stored copy keeps the target id);
    /// [`CheckpointError::NotFound`](crate::CheckpointError::NotFound) if no
    /// such checkpoint exists. With `checkpoint_id` absent the checkpoint is
    /// pushed to the front of the history. Returns the updated run config
    /// pointing at the stored checkpoint.
    async fn put(
        &self,
        thread: &str,
        checkpoint_id: Option<&str>,
        checkpoint: Checkpoint,
    ) -> Result<RunConfig>;

    /// Delete the thread's current history. Returns whether anything was
    /// deleted.
    async fn clear(&self, thread: &str) -> Result<bool>;

    /// Close the thread's current internal identity and hand back its
    /// history. Idempotent: a second release returns an empty [`Tag`].
    async fn release(&self, thread: &str) -> Result<Tag>;

    /// Most recent checkpoint for a thread, if any.
    async fn latest(&self, thread: &str) -> Result<Option<Checkpoint>> {
        self.get(thread, None).await
    }

    /// History as a stream, most recent first.
    async fn history(&self, thread: &str) -> Result<CheckpointStream> {
        let checkpoints = self.list(thread).await?;
        Ok(Box::pin(stream::iter(checkpoints.into_iter().map(Ok))))
    }
}
