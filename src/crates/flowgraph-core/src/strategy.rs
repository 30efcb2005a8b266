//! Per-key merge strategies for state updates
//!
//! Node actions return partial updates; the engine merges each key of an
//! update into the accumulated state through a [`KeyStrategy`]. Every state
//! key a graph writes must be registered in the graph's
//! [`KeyStrategyRegistry`] before compilation; writing an unregistered key
//! fails the step with [`GraphError::UnregisteredKey`].
//!
//! Two strategies cover most graphs:
//!
//! - [`ReplaceStrategy`] - the new value wins (counters, flags, scalars)
//! - [`AppendStrategy`] - values accumulate into an array (messages, logs),
//!   with tombstone entries for targeted removal
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::strategy::{AppendStrategy, KeyStrategyRegistry, ReplaceStrategy};
//! use serde_json::json;
//!
//! let mut registry = KeyStrategyRegistry::new();
//! registry.register("count", ReplaceStrategy);
//! registry.register("messages", AppendStrategy);
//!
//! let state = json!({"count": 1, "messages": ["hi"]});
//! let merged = registry
//!     .apply(state, json!({"count": 2, "messages": "there"}))
//!     .unwrap();
//!
//! assert_eq!(merged, json!({"count": 2, "messages": ["hi", "there"]}));
//! ```
//!
//! # Tombstones
//!
//! An appended entry of the form `{"__remove__": <id>}` is not stored;
//! instead it deletes previously accumulated entries whose `"id"` field
//! equals `<id>`. This lets a later node retract something an earlier node
//! appended without replacing the whole array.

use crate::error::{GraphError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Marker key identifying a tombstone entry in an append update
pub const REMOVE_MARKER: &str = "__remove__";

/// How updates to one state key merge into the accumulated state
pub trait KeyStrategy: Send + Sync {
    /// Merge a new value into the previous value for this key
    fn merge(&self, old: Option<Value>, new: Value) -> Value;
}

/// The new value replaces the old one
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceStrategy;

impl KeyStrategy for ReplaceStrategy {
    fn merge(&self, _old: Option<Value>, new: Value) -> Value {
        new
    }
}

/// Values accumulate into an array, most recent last
///
/// A scalar update appends one element; an array update appends each of its
/// elements. Tombstones (see [`REMOVE_MARKER`]) delete matching entries
/// instead of being appended. A non-array previous value is treated as a
/// single already-accumulated element.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendStrategy;

impl AppendStrategy {
    fn tombstone_id(entry: &Value) -> Option<&Value> {
        entry.as_object().and_then(|obj| obj.get(REMOVE_MARKER))
    }

    fn apply_entry(accumulated: &mut Vec<Value>, entry: Value) {
        match Self::tombstone_id(&entry) {
            Some(remove_id) => {
                accumulated.retain(|existing| existing.get("id") != Some(remove_id));
            }
            None => accumulated.push(entry),
        }
    }
}

impl KeyStrategy for AppendStrategy {
    fn merge(&self, old: Option<Value>, new: Value) -> Value {
        let mut accumulated = match old {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };

        match new {
            Value::Array(entries) => {
                for entry in entries {
                    Self::apply_entry(&mut accumulated, entry);
                }
            }
            entry => Self::apply_entry(&mut accumulated, entry),
        }

        Value::Array(accumulated)
    }
}

/// Explicit per-graph mapping from state key to merge strategy
///
/// Registered once while building a graph, then moved into the compiled
/// graph. Never a process-wide global: two graphs in the same process can
/// merge the same key differently.
#[derive(Clone, Default)]
pub struct KeyStrategyRegistry {
    strategies: HashMap<String, Arc<dyn KeyStrategy>>,
}

impl std::fmt::Debug for KeyStrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("KeyStrategyRegistry")
            .field("keys", &keys)
            .finish()
    }
}

impl KeyStrategyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the merge strategy for a state key
    pub fn register(&mut self, key: impl Into<String>, strategy: impl KeyStrategy + 'static) {
        self.strategies.insert(key.into(), Arc::new(strategy));
    }

    /// Strategy for a key, if registered
    pub fn get(&self, key: &str) -> Option<&Arc<dyn KeyStrategy>> {
        self.strategies.get(key)
    }

    /// Whether a key has a registered strategy
    pub fn contains(&self, key: &str) -> bool {
        self.strategies.contains_key(key)
    }

    /// Merge a partial update into the accumulated state.
    ///
    /// Every key in `update` must be registered; the first unregistered key
    /// rejects the whole update and the state is returned unchanged to the
    /// caller's copy. A non-object update is rejected as invalid.
    pub fn apply(&self, mut state: Value, update: Value) -> Result<Value> {
        let entries = match update {
            Value::Object(map) => map,
            other => {
                return Err(GraphError::invalid(format!(
                    "state update must be a JSON object, got {other}"
                )))
            }
        };

        for key in entries.keys() {
            if !self.contains(key) {
                return Err(GraphError::UnregisteredKey { key: key.clone() });
            }
        }

        let target = match state.as_object_mut() {
            Some(obj) => obj,
            None => {
                return Err(GraphError::invalid(format!(
                    "state must be a JSON object, got {state}"
                )))
            }
        };

        for (key, new_value) in entries {
            let strategy = &self.strategies[&key];
            let old = target.remove(&key);
            target.insert(key, strategy.merge(old, new_value));
        }
        Ok(state)
    }
}
