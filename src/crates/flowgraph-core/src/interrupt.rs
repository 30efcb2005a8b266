//! Human-in-the-loop interrupt and resume protocol
//!
//! An interruptible node may pause a run *after* its action produced an
//! update but *before* that update is committed. The engine hands the
//! caller an [`InterruptionMetadata`] describing the items awaiting review;
//! the caller resolves each item and resumes the run on the same thread.
//!
//! # State machine
//!
//! ```text
//!               hook returns None
//!   PENDING ───────────────────────────▶ ADVANCE (update commits)
//!      │
//!      │ hook returns Some(metadata)
//!      ▼
//!   SUSPENDED ──── valid feedback ─────▶ ADVANCE (rewritten update commits)
//!      │
//!      └───── missing / partial / ──────▶ SUSPENDED (no-op, not an error)
//!             mismatched feedback
//! ```
//!
//! Valid feedback is non-empty, fully resolved (every item carries a
//! [`FeedbackResult`]), and covers *exactly* the pending item ids. Anything
//! less leaves the run suspended; resuming with bad feedback is never an
//! error, it simply does not advance.
//!
//! # Feedback application
//!
//! When valid feedback arrives, the suspended update is rewritten before it
//! is merged:
//!
//! - **Approved** items pass through unchanged
//! - **Edited** items have their `arguments` replaced with the edited value
//! - **Rejected** items are replaced by a synthetic failure entry carrying
//!   the rejection reason, so downstream nodes observe the refusal instead
//!   of the original action
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::interrupt::{FeedbackItem, FeedbackResult, InterruptionMetadata};
//! use serde_json::json;
//!
//! let pending = InterruptionMetadata::new(
//!     "approve_tools",
//!     vec![FeedbackItem::new("call-1", "delete a file", json!({"path": "/tmp/x"}))],
//! );
//!
//! let feedback = vec![
//!     FeedbackItem::new("call-1", "delete a file", json!({"path": "/tmp/x"}))
//!         .with_result(FeedbackResult::Rejected("not in prod".to_string())),
//! ];
//! assert!(pending.accepts(&feedback));
//! ```

use crate::graph::NodeId;
use flowgraph_checkpoint::RunConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Run-config metadata key under which the engine reports a suspension
pub const INTERRUPTION_KEY: &str = "interruption";

/// Run-config metadata key under which the caller supplies resolved feedback
pub const FEEDBACK_KEY: &str = "feedback";

/// Reserved state key holding the pending interruption inside the
/// suspension checkpoint, so a resumed process can recover it
pub const INTERRUPTION_STATE_KEY: &str = "__interruption__";

/// Decides whether a node's produced update should suspend the run.
///
/// Called with the node id, the proposed (uncommitted) update, and the run
/// config. Returning `Some` suspends; `None` lets the step commit.
pub type InterruptHook =
    Arc<dyn Fn(&str, &Value, &RunConfig) -> Option<InterruptionMetadata> + Send + Sync>;

/// The caller's verdict on one pending item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeedbackResult {
    /// Execute the item as proposed
    Approved,
    /// Execute the item with substituted arguments
    Edited(Value),
    /// Do not execute; the reason becomes a synthetic failure entry
    Rejected(String),
}

/// One reviewable item within an interruption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    /// Identifier correlating the item with an entry in the pending update
    pub id: String,

    /// Human-readable description of what is awaiting review
    pub description: String,

    /// The proposed arguments, as produced by the node
    pub arguments: Value,

    /// The caller's verdict; `None` while unresolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FeedbackResult>,
}

impl FeedbackItem {
    /// Create an unresolved item
    pub fn new(id: impl Into<String>, description: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            arguments,
            result: None,
        }
    }

    /// Attach a verdict
    pub fn with_result(mut self, result: FeedbackResult) -> Self {
        self.result = Some(result);
        self
    }
}

/// What a suspended run is waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionMetadata {
    /// The interruptible node that triggered the suspension
    pub node: NodeId,

    /// Items awaiting review, in the order the node proposed them
    pub items: Vec<FeedbackItem>,
}

impl InterruptionMetadata {
    /// Create metadata for a node's pending items
    pub fn new(node: impl Into<String>, items: Vec<FeedbackItem>) -> Self {
        Self {
            node: node.into(),
            items,
        }
    }

    /// Whether `feedback` fully resolves this interruption.
    ///
    /// Requires a non-empty feedback set, a verdict on every item, and an
    /// item-id set exactly equal to the pending ids. Partial or mismatched
    /// feedback is refused so a run never advances on half an answer.
    pub fn accepts(&self, feedback: &[FeedbackItem]) -> bool {
        if feedback.is_empty() {
            return false;
        }
        if feedback.iter().any(|item| item.result.is_none()) {
            return false;
        }
        let pending: BTreeSet<&str> = self.items.iter().map(|item| item.id.as_str()).collect();
        let resolved: BTreeSet<&str> = feedback.iter().map(|item| item.id.as_str()).collect();
        pending == resolved
    }
}

/// A suspension as persisted with its checkpoint: the interruption plus the
/// uncommitted update it is holding back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterruption {
    pub node: NodeId,
    pub items: Vec<FeedbackItem>,
    /// The node's proposed update, held until feedback arrives
    pub update: Value,
}

impl PendingInterruption {
    pub fn new(metadata: InterruptionMetadata, update: Value) -> Self {
        Self {
            node: metadata.node,
            items: metadata.items,
            update,
        }
    }

    pub fn metadata(&self) -> InterruptionMetadata {
        InterruptionMetadata::new(self.node.clone(), self.items.clone())
    }
}

/// Rewrite a suspended update according to resolved feedback.
///
/// Every array entry in the update whose `"id"` matches a feedback item is
/// rewritten per that item's verdict; entries without a matching feedback
/// item and non-array values pass through untouched.
pub fn apply_feedback(update: Value, feedback: &[FeedbackItem]) -> Value {
    let mut update = update;
    let Some(map) = update.as_object_mut() else {
        return update;
    };

    for value in map.values_mut() {
        let Some(entries) = value.as_array_mut() else {
            continue;
        };
        for entry in entries.iter_mut() {
            let Some(entry_id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let Some(item) = feedback.iter().find(|item| item.id == entry_id) else {
                continue;
            };
            match &item.result {
                Some(FeedbackResult::Approved) | None => {}
                Some(FeedbackResult::Edited(arguments)) => {
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert("arguments".to_string(), arguments.clone());
                    }
                }
                Some(FeedbackResult::Rejected(reason)) => {
                    *entry = json!({
                        "id": item.id,
                        "status": "rejected",
                        "error": reason,
                    });
                }
            }
        }
    }
    update
}

/// Convenience hook: suspend whenever the node's update contains a
/// non-empty array under `key`, exposing each entry as a reviewable item.
///
/// Entries are expected to carry `"id"` and optionally `"description"` and
/// `"arguments"` fields; entries without an id are skipped.
pub fn review_items_under(key: impl Into<String>) -> InterruptHook {
    let key = key.into();
    Arc::new(move |node: &str, update: &Value, _config: &RunConfig| {
        let entries = update.get(&key)?.as_array()?;
        let items: Vec<FeedbackItem> = entries
            .iter()
            .filter_map(|entry| {
                let id = entry.get("id")?.as_str()?;
                let description = entry
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let arguments = entry.get("arguments").cloned().unwrap_or(Value::Null);
                Some(FeedbackItem::new(id, description, arguments))
            })
            .collect();
        if items.is_empty() {
            return None;
        }
        Some(InterruptionMetadata::new(node, items))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> InterruptionMetadata {
        InterruptionMetadata::new(
            "gate",
            vec![
                FeedbackItem::new("a", "first", json!({"n": 1})),
                FeedbackItem::new("b", "second", json!({"n": 2})),
            ],
        )
    }

    fn resolved(id: &str, result: FeedbackResult) -> FeedbackItem {
        FeedbackItem::new(id, "", Value::Null).with_result(result)
    }

    #[test]
    fn test_empty_feedback_is_refused() {
        assert!(!pending().accepts(&[]));
    }

    #[test]
    fn test_unresolved_item_is_refused() {
        let feedback = vec![
            resolved("a", FeedbackResult::Approved),
            FeedbackItem::new("b", "", Value::Null),
        ];
        assert!(!pending().accepts(&feedback));
    }

    #[test]
    fn test_partial_coverage_is_refused() {
        let feedback = vec![resolved("a", FeedbackResult::Approved)];
        assert!(!pending().accepts(&feedback));
    }

    #[test]
    fn test_extra_item_is_refused() {
        let feedback = vec![
            resolved("a", FeedbackResult::Approved),
            resolved("b", FeedbackResult::Approved),
            resolved("stray", FeedbackResult::Approved),
        ];
        assert!(!pending().accepts(&feedback));
    }

    #[test]
    fn test_exact_resolved_set_is_accepted() {
        let feedback = vec![
            resolved("a", FeedbackResult::Approved),
            resolved("b", FeedbackResult::Edited(json!({"n": 20}))),
        ];
        assert!(pending().accepts(&feedback));
    }

    #[test]
    fn test_apply_feedback_rewrites_entries() {
        let update = json!({
            "actions": [
                {"id": "a", "arguments": {"n": 1}},
                {"id": "b", "arguments": {"n": 2}},
                {"id": "c", "arguments": {"n": 3}}
            ]
        });
        let feedback = vec![
            resolved("a", FeedbackResult::Approved),
            resolved("b", FeedbackResult::Edited(json!({"n": 20}))),
            resolved("c", FeedbackResult::Rejected("nope".to_string())),
        ];

        let rewritten = apply_feedback(update, &feedback);
        let actions = rewritten["actions"].as_array().unwrap();
        assert_eq!(actions[0], json!({"id": "a", "arguments": {"n": 1}}));
        assert_eq!(actions[1], json!({"id": "b", "arguments": {"n": 20}}));
        assert_eq!(
            actions[2],
            json!({"id": "c", "status": "rejected", "error": "nope"})
        );
    }

    #[test]
    fn test_apply_feedback_leaves_unrelated_values_alone() {
        let update = json!({"count": 7, "actions": [{"id": "x"}]});
        let feedback = vec![resolved("x", FeedbackResult::Approved)];
        let rewritten = apply_feedback(update.clone(), &feedback);
        assert_eq!(rewritten, update);
    }

    #[test]
    fn test_review_hook_extracts_items() {
        let hook = review_items_under("actions");
        let update = json!({
            "actions": [{"id": "t1", "description": "send mail", "arguments": {"to": "x"}}]
        });
        let metadata = hook("gate", &update, &RunConfig::new("t")).unwrap();
        assert_eq!(metadata.node, "gate");
        assert_eq!(metadata.items.len(), 1);
        assert_eq!(metadata.items[0].id, "t1");
        assert_eq!(metadata.items[0].arguments, json!({"to": "x"}));
    }

    #[test]
    fn test_review_hook_ignores_empty_updates() {
        let hook = review_items_under("actions");
        assert!(hook("gate", &json!({"actions": []}), &RunConfig::new("t")).is_none());
        assert!(hook("gate", &json!({"other": 1}), &RunConfig::new("t")).is_none());
    }

    #[test]
    fn test_pending_interruption_round_trip() {
        let record = PendingInterruption::new(pending(), json!({"actions": []}));
        let encoded = serde_json::to_value(&record).unwrap();
        let decoded: PendingInterruption = serde_json::from_value(encoded).unwrap();
        assert_eq!(record, decoded);
    }
}
