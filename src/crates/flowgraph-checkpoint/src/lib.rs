//! # flowgraph-checkpoint
//!
//! Durable checkpoint storage for flowgraph execution.
//!
//! The execution engine snapshots merged state after every committed step.
//! This crate owns those snapshots: the [`Checkpoint`] data model, the
//! [`CheckpointStore`] contract, and three interchangeable backends.
//!
//! ```text
//!                    ┌───────────────────────┐
//!   engine ───put──▶ │   CheckpointStore     │ ◀──get/list─── resume /
//!                    │   (trait object)      │                inspection
//!                    └───────────┬───────────┘
//!              ┌─────────────────┼─────────────────┐
//!              ▼                 ▼                 ▼
//!      MemoryCheckpoint   SqliteCheckpoint   RedisCheckpoint
//!      Store              Store              Store
//!      (process-local)    (`sqlite` feat.)   (`redis` feat.)
//! ```
//!
//! # Choosing a backend
//!
//! | Backend | Durability | Concurrency | Use for |
//! |---------|------------|-------------|---------|
//! | [`MemoryCheckpointStore`] | none | single `RwLock` | tests, prototypes |
//! | `SqliteCheckpointStore` | file | one transaction per thread row | single-host services |
//! | `RedisCheckpointStore` | server | per-thread distributed locks | multi-process deployments |
//!
//! All three satisfy the same contract: histories are ordered most recent
//! first, `put` without an id pushes while `put` with an id replaces, and
//! `release` closes a thread's internal identity so the same display name
//! can start over with no resurrected history.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use flowgraph_checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, RunConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryCheckpointStore::new();
//!
//!     // One checkpoint per committed step.
//!     let config = store
//!         .put("session-42", None, Checkpoint::new(json!({"count": 1})).with_node("ingest"))
//!         .await?;
//!     println!("stored checkpoint {:?}", config.checkpoint_id);
//!
//!     // Resume from the most recent snapshot.
//!     if let Some(latest) = store.latest("session-42").await? {
//!         println!("resuming from state {}", latest.state);
//!     }
//!
//!     // Close the session for good.
//!     let tag = store.release("session-42").await?;
//!     println!("released {} checkpoints", tag.checkpoints.len());
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `sqlite` - enables [`sqlite::SqliteCheckpointStore`] (pulls in `sqlx`)
//! - `redis` - enables [`redis::RedisCheckpointStore`] (pulls in `redis`)

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use checkpoint::{Checkpoint, Tag};
pub use config::RunConfig;
pub use error::{CheckpointError, Result};
pub use memory::MemoryCheckpointStore;
pub use traits::{CheckpointStore, CheckpointStream};

#[cfg(feature = "redis")]
pub use crate::redis::RedisCheckpointStore;
#[cfg(feature = "sqlite")]
pub use crate::sqlite::SqliteCheckpointStore;
