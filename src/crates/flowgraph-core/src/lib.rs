//! # flowgraph-core
//!
//! A state-graph execution engine: declare nodes and edges, compile, then
//! run with per-key state merging, parallel fan-out, durable checkpoints,
//! and human-in-the-loop interrupts.
//!
//! ```text
//!                 ┌─────────────────────────────────────────────┐
//!                 │                StateGraph                   │
//!                 │   nodes + edges + key merge strategies      │
//!                 └──────────────────┬──────────────────────────┘
//!                                    │ compile()
//!                                    ▼
//!                 ┌─────────────────────────────────────────────┐
//!                 │               CompiledGraph                 │
//!                 │  fan-outs synthesized into region nodes     │
//!                 │  .with_checkpoint_store(...)                │
//!                 │  .with_cancellation_token(...)              │
//!                 │  .with_retry_policy(...)                    │
//!                 └──────┬───────────────┬──────────────┬───────┘
//!                        │ invoke()      │ run()        │ stream()
//!                        ▼               ▼              ▼
//!                   final state     RunOutcome     NodeOutput per
//!                                 (or suspended)   committed step
//! ```
//!
//! # Execution model
//!
//! A run advances one *step* at a time from [`START`] to [`END`]. Each step
//! executes one compiled node, merges its partial update into the
//! accumulated state through the per-key [`KeyStrategy`] registry, persists
//! a checkpoint when a store is attached, and only then resolves the next
//! node. A failing step commits nothing; re-invoking the same thread
//! continues from the last committed checkpoint.
//!
//! Two or more direct edges out of one node declare a parallel fan-out. The
//! compiler replaces the region with a single synthesized node; at run time
//! its branches execute concurrently and merge in declaration order, so
//! results are deterministic regardless of completion order.
//!
//! # Quick start
//!
//! ```rust
//! use flowgraph_core::{StateGraph, ReplaceStrategy, AppendStrategy, START, END};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new();
//! graph
//!     .register_key("topic", ReplaceStrategy)
//!     .register_key("notes", AppendStrategy)
//!     .add_node("research", |state| {
//!         Box::pin(async move {
//!             let topic = state["topic"].as_str().unwrap_or("").to_string();
//!             Ok(json!({"notes": format!("looked into {topic}")}))
//!         })
//!     })
//!     .add_edge(START, "research")
//!     .add_edge("research", END);
//!
//! let compiled = graph.compile()?;
//! let result = compiled.invoke(json!({"topic": "graphs"})).await?;
//! assert_eq!(result["notes"], json!(["looked into graphs"]));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`builder`] | [`StateGraph`]: declare nodes, edges, merge strategies |
//! | [`compile`] | Validation and fan-out synthesis into [`CompiledGraph`] |
//! | [`executor`] | The step loop: invoke, run, stream |
//! | [`strategy`] | Per-key merge strategies ([`ReplaceStrategy`], [`AppendStrategy`]) |
//! | [`interrupt`] | Suspend/resume protocol for human feedback |
//! | [`retry`] | Exponential backoff around node actions |
//! | [`error`] | [`GraphError`] taxonomy |
//! | [`config`] | [`ConfigCell`] for shared, swappable configuration |
//!
//! Checkpoint persistence lives in the companion `flowgraph-checkpoint`
//! crate; its core types ([`Checkpoint`], [`CheckpointStore`],
//! [`MemoryCheckpointStore`], [`RunConfig`]) are re-exported here.

pub mod builder;
pub mod compile;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod interrupt;
pub mod retry;
pub mod strategy;
mod visualization;

pub use builder::StateGraph;
pub use compile::{
    BranchChain, CompiledGraph, CompiledNode, NestedGraph, NodeKind, DEFAULT_RECURSION_LIMIT,
};
pub use config::ConfigCell;
pub use error::{BoxError, GraphError, Result};
pub use executor::{NodeOutput, NodeStream, RunOutcome};
pub use graph::{NodeAction, NodeId, Router, END, PARALLEL_PREFIX, START};
pub use interrupt::{
    apply_feedback, review_items_under, FeedbackItem, FeedbackResult, InterruptHook,
    InterruptionMetadata, PendingInterruption, FEEDBACK_KEY, INTERRUPTION_KEY,
    INTERRUPTION_STATE_KEY,
};
pub use retry::RetryPolicy;
pub use strategy::{
    AppendStrategy, KeyStrategy, KeyStrategyRegistry, ReplaceStrategy, REMOVE_MARKER,
};

pub use flowgraph_checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore, RunConfig, Tag,
};
