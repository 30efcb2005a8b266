//! Error types for graph construction and execution
//!
//! All failures surface as [`GraphError`] via `thiserror`. Construction
//! problems are reported at `compile()` time and name the offending node or
//! edge; run-time problems carry the failing node and the underlying source.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── MissingNode        - Node has no outgoing edge and is not END
//! ├── DanglingEdge       - Edge references an undefined node
//! ├── DuplicateNode      - Node id registered twice
//! ├── DivergentBranches  - Fan-out branches never reconverge
//! ├── InvalidGraph       - Other structural problems
//! ├── NodeExecution      - A node action failed
//! ├── UnknownRouteTarget - Router returned a label absent from its map
//! ├── UnregisteredKey    - Update wrote a key with no merge strategy
//! ├── RecursionLimit     - Step limit exceeded
//! ├── Suspended          - Run paused awaiting feedback, surfaced through
//! │                        an API that cannot return an interruption
//! ├── Cancelled          - Cooperative cancellation observed
//! └── Checkpoint         - Persistence errors (from flowgraph-checkpoint)
//! ```
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::error::GraphError;
//!
//! fn report(err: &GraphError) {
//!     match err {
//!         GraphError::NodeExecution { node, .. } => {
//!             eprintln!("node '{node}' failed");
//!         }
//!         GraphError::DivergentBranches { node } => {
//!             eprintln!("branches out of '{node}' never reconverge");
//!         }
//!         other => eprintln!("{other}"),
//!     }
//! }
//! ```

use flowgraph_checkpoint::CheckpointError;
use thiserror::Error;

/// Boxed error produced by node actions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building, compiling, or executing a graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A non-END node has no outgoing edge
    #[error("Node '{node}' has no outgoing edge and is not the END node")]
    MissingNode { node: String },

    /// An edge references a node that was never added
    #[error("Edge from '{from}' references undefined node '{to}'")]
    DanglingEdge { from: String, to: String },

    /// The same node id was added twice
    #[error("Node '{node}' is already defined")]
    DuplicateNode { node: String },

    /// Branches fanning out of a node never reconverge on a common node
    #[error("Branches out of '{node}' never reconverge on a single node")]
    DivergentBranches { node: String },

    /// Any other structural problem
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A node action returned an error
    #[error("Node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: BoxError,
    },

    /// A router returned a label with no entry in its target map
    #[error("Router at '{node}' returned unknown target label '{label}'")]
    UnknownRouteTarget { node: String, label: String },

    /// A state update wrote a key with no registered merge strategy
    #[error("No merge strategy registered for state key '{key}'")]
    UnregisteredKey { key: String },

    /// The run exceeded its step limit
    #[error("Recursion limit of {limit} steps exceeded")]
    RecursionLimit { limit: usize },

    /// The run suspended awaiting feedback. Returned by `invoke` and
    /// `stream`, which cannot hand back an interruption; use `run` to
    /// drive interruptible graphs.
    #[error("Run suspended at node '{node}' awaiting feedback")]
    Suspended { node: String },

    /// The run observed its cancellation token
    #[error("Execution cancelled")]
    Cancelled,

    /// A checkpoint operation failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl GraphError {
    /// Wrap a node action failure
    pub fn node_execution(node: impl Into<String>, source: impl Into<BoxError>) -> Self {
        GraphError::NodeExecution {
            node: node.into(),
            source: source.into(),
        }
    }

    /// Structural problem not covered by a dedicated variant
    pub fn invalid(msg: impl Into<String>) -> Self {
        GraphError::InvalidGraph(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = GraphError::MissingNode {
            node: "orphan".to_string(),
        };
        assert!(err.to_string().contains("orphan"));

        let err = GraphError::DanglingEdge {
            from: "a".to_string(),
            to: "ghost".to_string(),
        };
        assert!(err.to_string().contains("ghost"));

        let err = GraphError::UnregisteredKey {
            key: "messages".to_string(),
        };
        assert!(err.to_string().contains("messages"));
    }

    #[test]
    fn test_node_execution_preserves_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = GraphError::node_execution("writer", inner);
        assert!(err.to_string().contains("writer"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_checkpoint_errors_convert() {
        let err: GraphError = CheckpointError::NotFound.into();
        assert!(matches!(err, GraphError::Checkpoint(_)));
    }
}
