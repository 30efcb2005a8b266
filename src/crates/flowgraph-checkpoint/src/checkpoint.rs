//! Core checkpoint data structures
//!
//! A [`Checkpoint`] is a snapshot of graph execution state captured after one
//! durable step. Checkpoints are grouped per thread into an ordered history
//! (most recent first) and enable:
//!
//! - **Resumption** - Continue an interrupted or failed run from the last
//!   committed step
//! - **Time-Travel** - Re-enter execution at any historical snapshot
//! - **Human-in-the-Loop** - Persist a suspended step while waiting for
//!   external feedback
//! - **Audit Trails** - Inspect how state evolved across a run
//!
//! # Structure
//!
//! ```text
//! Thread "support-session-42"
//!   ┌──────────────────────────────────────┐
//!   │ Checkpoint 3  (most recent)          │  ← get(thread, None)
//!   │   id:         550e8400-e29b-...      │
//!   │   node:       "summarize"            │
//!   │   state:      {"x": 1, "y": [2, 3]}  │
//!   │   created_at: 2025-06-02T10:04:11Z   │
//!   ├──────────────────────────────────────┤
//!   │ Checkpoint 2                         │
//!   ├──────────────────────────────────────┤
//!   │ Checkpoint 1  (oldest)               │
//!   └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use flowgraph_checkpoint::Checkpoint;
//! use serde_json::json;
//!
//! let checkpoint = Checkpoint::new(json!({"messages": ["hello"]}))
//!     .with_node("chatbot");
//!
//! assert_eq!(checkpoint.node.as_deref(), Some("chatbot"));
//! assert!(!checkpoint.id.is_empty());
//! ```
//!
//! Checkpoint content is serialized as JSON by every backend. State is an
//! arbitrary [`serde_json::Value`], so the wire format must be
//! self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A snapshot of execution state at one durable step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier within the thread
    pub id: String,

    /// Node whose committed step produced this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Full merged state at the time of the snapshot
    pub state: Value,

    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint with a generated id
    pub fn new(state: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node: None,
            state,
            created_at: Utc::now(),
        }
    }

    /// Set the node that produced this snapshot
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Override the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The closed history of a released thread
///
/// Returned by `release`: the human-readable thread name together with the
/// checkpoint history that was current when the thread's internal identity
/// was closed. Releasing an already-released (or unknown) thread yields an
/// empty tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Human-readable thread name
    pub thread_name: String,

    /// History at release time, most recent first
    pub checkpoints: Vec<Checkpoint>,
}

impl Tag {
    /// Create an empty tag for a thread name
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            checkpoints: Vec::new(),
        }
    }

    /// Create a tag carrying a released history
    pub fn with_checkpoints(thread_name: impl Into<String>, checkpoints: Vec<Checkpoint>) -> Self {
        Self {
            thread_name: thread_name.into(),
            checkpoints,
        }
    }

    /// Whether the tag carries no history
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_creation() {
        let cp = Checkpoint::new(json!({"x": 1}));
        assert!(!cp.id.is_empty());
        assert_eq!(cp.node, None);
        assert_eq!(cp.state, json!({"x": 1}));
    }

    #[test]
    fn test_checkpoint_builders() {
        let cp = Checkpoint::new(json!({}))
            .with_node("analyze")
            .with_id("cp-1");
        assert_eq!(cp.node.as_deref(), Some("analyze"));
        assert_eq!(cp.id, "cp-1");
    }

    #[test]
    fn test_checkpoint_json_round_trip() {
        let cp = Checkpoint::new(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "count": 3,
            "nested": {"a": [1, 2, null]}
        }))
        .with_node("chatbot");

        let encoded = serde_json::to_string(&cp).unwrap();
        let decoded: Checkpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cp, decoded);
    }

    #[test]
    fn test_tag_empty() {
        let tag = Tag::new("t1");
        assert_eq!(tag.thread_name, "t1");
        assert!(tag.is_empty());
    }

    #[test]
    fn test_tag_with_history() {
        let cps = vec![Checkpoint::new(json!({"a": 1}))];
        let tag = Tag::with_checkpoints("t1", cps);
        assert!(!tag.is_empty());
        assert_eq!(tag.checkpoints.len(), 1);
    }
}
