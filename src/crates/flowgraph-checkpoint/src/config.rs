//! Run configuration for checkpointed execution
//!
//! [`RunConfig`] identifies which thread a run belongs to, optionally which
//! historical checkpoint to resume from, and carries an opaque metadata bag
//! used to pass values (such as pending interruption records and their
//! feedback) between the engine and the caller.
//!
//! # Example
//!
//! ```rust
//! use flowgraph_checkpoint::RunConfig;
//! use serde_json::json;
//!
//! let config = RunConfig::new("support-session-42")
//!     .with_checkpoint_id("550e8400-e29b-41d4-a716-446655440000")
//!     .with_metadata("user", json!("alice"));
//!
//! assert_eq!(config.thread_id.as_deref(), Some("support-session-42"));
//! assert_eq!(config.metadata("user"), Some(&json!("alice")));
//! ```

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Configuration for a single checkpointed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Thread name grouping this run's checkpoint history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint to resume from (defaults to the most recent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,

    /// Opaque metadata bag carried in and out of the run
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl RunConfig {
    /// Create a config for a thread
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            checkpoint_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Select a specific checkpoint to resume from
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a metadata entry
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Insert a metadata entry in place
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// The thread id, or an error if the config has none
    pub fn require_thread(&self) -> Result<&str> {
        self.thread_id
            .as_deref()
            .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
    }
}
