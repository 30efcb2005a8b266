//! High-level graph builder
//!
//! [`StateGraph`] is the entry point of the crate: declare nodes, wire
//! edges, register merge strategies, then [`compile`](StateGraph::compile)
//! into an executable [`CompiledGraph`](crate::CompiledGraph).
//!
//! Building is order-independent; nothing is checked until `compile()`,
//! which validates the whole structure at once and reports the first
//! problem by name.
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::{StateGraph, ReplaceStrategy, START, END};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new();
//! graph
//!     .register_key("count", ReplaceStrategy)
//!     .add_node("increment", |state| {
//!         Box::pin(async move {
//!             let count = state["count"].as_i64().unwrap_or(0);
//!             Ok(json!({"count": count + 1}))
//!         })
//!     })
//!     .add_edge(START, "increment")
//!     .add_edge("increment", END);
//!
//! let compiled = graph.compile()?;
//! let result = compiled.invoke(json!({"count": 0})).await?;
//! assert_eq!(result["count"], 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Conditional routing
//!
//! ```rust
//! use flowgraph_core::{StateGraph, START, END};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let mut graph = StateGraph::new();
//! // ... add "triage", "simple", "escalate" nodes ...
//! graph.add_conditional_edge(
//!     "triage",
//!     Arc::new(|state| {
//!         if state["priority"] == "high" { "up".to_string() } else { "flat".to_string() }
//!     }),
//!     HashMap::from([
//!         ("up".to_string(), "escalate".to_string()),
//!         ("flat".to_string(), "simple".to_string()),
//!     ]),
//! );
//! ```

use crate::compile::{compile, CompiledGraph};
use crate::error::{BoxError, Result};
use crate::graph::{Edge, NodeAction, NodeId, NodeSpec, Router};
use crate::interrupt::InterruptHook;
use crate::strategy::{KeyStrategy, KeyStrategyRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Mutable graph under construction
#[derive(Default)]
pub struct StateGraph {
    pub(crate) nodes: HashMap<NodeId, NodeSpec>,
    /// Node ids in declaration order; parallel branches merge in this order
    pub(crate) node_order: Vec<NodeId>,
    pub(crate) edges: HashMap<NodeId, Vec<Edge>>,
    pub(crate) registry: KeyStrategyRegistry,
    /// Ids added more than once, reported at compile time
    pub(crate) duplicates: Vec<NodeId>,
}

impl std::fmt::Debug for StateGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateGraph")
            .field("nodes", &self.node_order)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

impl StateGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the merge strategy for a state key.
    ///
    /// Every key any node writes must be registered before `compile()`;
    /// a write to an unregistered key fails the step at run time.
    pub fn register_key(
        &mut self,
        key: impl Into<String>,
        strategy: impl KeyStrategy + 'static,
    ) -> &mut Self {
        self.registry.register(key, strategy);
        self
    }

    /// Add a node with an async action.
    ///
    /// The action receives the full merged state and returns a partial
    /// update. Adding the same id twice is reported at `compile()` time.
    pub fn add_node<F>(&mut self, id: impl Into<String>, action: F) -> &mut Self
    where
        F: Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.insert_node(id.into(), Arc::new(action), None)
    }

    /// Add a node whose committed update is gated by an interrupt hook.
    ///
    /// The hook runs after the action produces its update and before the
    /// update is merged; returning `Some` suspends the run for feedback.
    pub fn add_node_with_interrupt<F>(
        &mut self,
        id: impl Into<String>,
        action: F,
        hook: InterruptHook,
    ) -> &mut Self
    where
        F: Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.insert_node(id.into(), Arc::new(action), Some(hook))
    }

    fn insert_node(
        &mut self,
        id: NodeId,
        action: NodeAction,
        interrupt: Option<InterruptHook>,
    ) -> &mut Self {
        let spec = NodeSpec {
            id: id.clone(),
            action,
            interrupt,
        };
        if self.nodes.insert(id.clone(), spec).is_some() {
            self.duplicates.push(id);
        } else {
            self.node_order.push(id);
        }
        self
    }

    /// Add an unconditional edge. Two or more direct edges out of the same
    /// node declare a fan-out that the compiler turns into a parallel
    /// region.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Direct(to.into()));
        self
    }

    /// Add a conditional edge: the router inspects state and returns a
    /// label, resolved to a node through `targets`.
    pub fn add_conditional_edge(
        &mut self,
        from: impl Into<String>,
        router: Router,
        targets: HashMap<String, NodeId>,
    ) -> &mut Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Conditional { router, targets });
        self
    }

    /// Validate the structure and produce an executable graph.
    ///
    /// Fan-out regions are synthesized here; see
    /// [`CompiledGraph`](crate::CompiledGraph) for what the output looks
    /// like. The registry moves into the compiled graph.
    pub fn compile(self) -> Result<CompiledGraph> {
        compile(self)
    }
}
