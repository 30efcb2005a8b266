//! Core graph data structures
//!
//! The building blocks consumed by [`StateGraph`](crate::StateGraph): node
//! identifiers, the async node action signature, and the edge variants that
//! define control flow. State is an untyped [`serde_json::Value`] snapshot;
//! node actions return *partial updates* that are merged through the graph's
//! [`KeyStrategyRegistry`](crate::strategy::KeyStrategyRegistry).
//!
//! # Structure
//!
//! ```text
//!  START ──▶ ingest ──▶ route ──┬──▶ summarize ──┐
//!                               │                ├──▶ publish ──▶ END
//!                               └──▶ classify ───┘
//!
//!  direct edge:      always taken after the source commits
//!  conditional edge: router inspects state, picks a label,
//!                    label resolves through the target map
//! ```
//!
//! # Node actions
//!
//! A node action receives the full merged state and returns a partial
//! update. It never mutates state directly; the engine owns the merge.
//!
//! ```rust
//! use flowgraph_core::graph::NodeAction;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let action: NodeAction = Arc::new(|state| {
//!     Box::pin(async move {
//!         let count = state["count"].as_i64().unwrap_or(0);
//!         Ok(json!({"count": count + 1}))
//!     })
//! });
//! ```
//!
//! # See Also
//!
//! - [`StateGraph`](crate::StateGraph) - the builder that assembles these
//! - [`CompiledGraph`](crate::CompiledGraph) - the executable output

use crate::error::BoxError;
use crate::interrupt::InterruptHook;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Node identifier, unique within a graph
pub type NodeId = String;

/// Virtual entry point of every graph
pub const START: &str = "__start__";

/// Virtual exit point of every graph
pub const END: &str = "__end__";

/// Prefix for node ids synthesized by the compiler for fan-out regions
pub const PARALLEL_PREFIX: &str = "__PARALLEL__";

/// Async node action: full state snapshot in, partial update out
pub type NodeAction = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Router for conditional edges: inspects state, returns a target label
pub type Router = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Control-flow edge out of a node
#[derive(Clone)]
pub enum Edge {
    /// Unconditional transition to a single node
    Direct(NodeId),

    /// State-dependent transition: the router's label is resolved through
    /// the target map. A label absent from the map fails the step at run
    /// time, naming the node and the label.
    Conditional {
        router: Router,
        targets: HashMap<String, NodeId>,
    },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            Edge::Conditional { targets, .. } => f
                .debug_struct("Conditional")
                .field("targets", targets)
                .finish_non_exhaustive(),
        }
    }
}

/// A node as declared on the builder: its action plus an optional
/// interrupt hook consulted before the node's update is committed
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub action: NodeAction,
    pub interrupt: Option<InterruptHook>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("interruptible", &self.interrupt.is_some())
            .finish_non_exhaustive()
    }
}

/// Synthesized id for the fan-out region rooted at `node`
pub fn parallel_id(node: &str) -> NodeId {
    format!("{PARALLEL_PREFIX}({node})")
}

/// Whether an id is one of the virtual sentinels
pub fn is_sentinel(id: &str) -> bool {
    id == START || id == END
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sentinels() {
        assert!(is_sentinel(START));
        assert!(is_sentinel(END));
        assert!(!is_sentinel("worker"));
    }

    #[test]
    fn test_parallel_id_format() {
        assert_eq!(parallel_id("A"), "__PARALLEL__(A)");
    }

    #[test]
    fn test_edge_debug_hides_router() {
        let edge = Edge::Conditional {
            router: Arc::new(|_| "yes".to_string()),
            targets: HashMap::from([("yes".to_string(), "b".to_string())]),
        };
        let rendered = format!("{edge:?}");
        assert!(rendered.contains("Conditional"));
        assert!(rendered.contains("yes"));
    }

    #[tokio::test]
    async fn test_node_action_returns_partial_update() {
        let action: NodeAction = Arc::new(|state| {
            Box::pin(async move {
                let count = state["count"].as_i64().unwrap_or(0);
                Ok(json!({"count": count + 1}))
            })
        });
        let update = action(json!({"count": 2})).await.unwrap();
        assert_eq!(update, json!({"count": 3}));
    }
}
