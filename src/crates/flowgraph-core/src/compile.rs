//! Graph compilation and fan-out synthesis
//!
//! `compile()` turns a validated [`StateGraph`](crate::StateGraph) into an
//! executable [`CompiledGraph`]. Linear structure compiles 1:1; a node with
//! two or more direct outgoing edges declares a *fan-out region* that the
//! compiler replaces with a single synthesized node.
//!
//! # Fan-out synthesis
//!
//! For a fan-out at `A`, every sibling branch is walked forward until the
//! branches reconverge on a first common node `Z`:
//!
//! ```text
//!            ┌──▶ B ──┐
//!   A ───────┤        ├──▶ Z          branch paths ≤ 2 nodes:
//!            └──▶ C ──┘               flat parallel-join node
//!
//!            ┌──▶ B ─▶ B2 ─▶ B3 ─┐
//!   A ───────┤                   ├──▶ Z    any path > 2 nodes:
//!            └──▶ C ─────────────┘         sub-graph node
//! ```
//!
//! Both synthesized forms take the edge-level id `__PARALLEL__(A)` and a
//! single outgoing edge to `Z`. Branches that never reconverge are a
//! compile-time error naming `A`. Nested fan-outs inside a branch are
//! synthesized recursively; a branch containing one always compiles to the
//! sub-graph form.
//!
//! At run time both forms behave identically: branches execute
//! concurrently, each branch sequentially, and their updates merge in
//! *declaration order* of the branches, never completion order. The
//! distinction is structural: the closed [`NodeKind`] enum tells tooling
//! (and the executor) exactly what a node is without any runtime type
//! inspection.
//!
//! # Restrictions inside regions
//!
//! Branch interiors must be statically walkable: a conditional edge or an
//! interruptible node inside a region is rejected at compile time. Both
//! remain fully supported outside regions, including on the fan-out source
//! and the convergence node themselves.

use crate::builder::StateGraph;
use crate::error::{GraphError, Result};
use crate::graph::{parallel_id, Edge, NodeAction, NodeId, END, START};
use crate::interrupt::InterruptHook;
use crate::retry::RetryPolicy;
use crate::strategy::KeyStrategyRegistry;
use flowgraph_checkpoint::CheckpointStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default step limit guarding non-terminating conditional cycles
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// A node in executable form
#[derive(Clone)]
pub struct CompiledNode {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// The closed set of executable node shapes
#[derive(Clone)]
pub enum NodeKind {
    /// One action, optionally gated by an interrupt hook
    Simple {
        action: NodeAction,
        interrupt: Option<InterruptHook>,
    },

    /// Flat fan-out region: every branch is at most two simple nodes
    ParallelJoin {
        branches: Vec<BranchChain>,
        join: NodeId,
    },

    /// Fan-out region with longer or nested branches, executed atomically
    SubGraph {
        graph: Box<NestedGraph>,
        join: NodeId,
    },
}

/// One branch of a fan-out region: nodes executed sequentially
#[derive(Clone, Default)]
pub struct BranchChain {
    pub steps: Vec<CompiledNode>,
}

/// The compiled interior of a sub-graph node
#[derive(Clone)]
pub struct NestedGraph {
    pub branches: Vec<BranchChain>,
}

impl fmt::Debug for CompiledNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Simple { interrupt, .. } => {
                if interrupt.is_some() {
                    "Simple+interrupt"
                } else {
                    "Simple"
                }
            }
            NodeKind::ParallelJoin { .. } => "ParallelJoin",
            NodeKind::SubGraph { .. } => "SubGraph",
        };
        f.debug_struct("CompiledNode")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

/// An executable graph: compiled nodes, rewritten control flow, the merge
/// registry, and run-time knobs attached via the `with_*` builders
pub struct CompiledGraph {
    pub(crate) nodes: HashMap<NodeId, CompiledNode>,
    pub(crate) flow: HashMap<NodeId, Vec<Edge>>,
    pub(crate) registry: KeyStrategyRegistry,
    pub(crate) recursion_limit: usize,
    pub(crate) store: Option<Arc<dyn CheckpointStore>>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) retry: Option<RetryPolicy>,
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("CompiledGraph")
            .field("nodes", &ids)
            .field("recursion_limit", &self.recursion_limit)
            .field("checkpointed", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl CompiledGraph {
    /// Persist a checkpoint after every committed step
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Observe a cancellation token between steps and while awaiting
    /// parallel branches
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Override the step limit (default
    /// [`DEFAULT_RECURSION_LIMIT`])
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Retry failing node actions with backoff before propagating
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Look up a compiled node
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    /// All compiled node ids, synthesized ones included
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub(crate) fn edges_from(&self, id: &str) -> Option<&[Edge]> {
        self.flow.get(id).map(Vec::as_slice)
    }
}

/// Compile a builder graph. Called through
/// [`StateGraph::compile`](crate::StateGraph::compile).
pub(crate) fn compile(builder: StateGraph) -> Result<CompiledGraph> {
    validate(&builder)?;

    let mut consumed: HashSet<NodeId> = HashSet::new();
    let mut nodes: HashMap<NodeId, CompiledNode> = HashMap::new();
    let mut flow: HashMap<NodeId, Vec<Edge>> = HashMap::new();

    // Walk the reachable graph from START, synthesizing fan-out regions as
    // they are encountered. Interior nodes land in `consumed` and never
    // appear in the outer flow.
    let mut queue: VecDeque<NodeId> = VecDeque::from([START.to_string()]);
    let mut visited: HashSet<NodeId> = HashSet::new();
    while let Some(source) = queue.pop_front() {
        if source == END || consumed.contains(&source) || !visited.insert(source.clone()) {
            continue;
        }
        let direct = direct_targets(&builder, &source);
        if direct.len() >= 2 {
            let (region, join) = synthesize_region(&builder, &source, &mut consumed)?;
            flow.insert(source.clone(), vec![Edge::Direct(region.id.clone())]);
            flow.insert(region.id.clone(), vec![Edge::Direct(join.clone())]);
            nodes.insert(region.id.clone(), region);
            queue.push_back(join);
        } else if let Some(edges) = builder.edges.get(&source) {
            for edge in edges {
                match edge {
                    Edge::Direct(to) => queue.push_back(to.clone()),
                    Edge::Conditional { targets, .. } => {
                        queue.extend(targets.values().cloned());
                    }
                }
            }
            flow.insert(source.clone(), edges.clone());
        }
    }

    for id in &builder.node_order {
        if consumed.contains(id) {
            continue;
        }
        let spec = &builder.nodes[id];
        nodes.insert(
            id.clone(),
            CompiledNode {
                id: id.clone(),
                kind: NodeKind::Simple {
                    action: spec.action.clone(),
                    interrupt: spec.interrupt.clone(),
                },
            },
        );
        flow.entry(id.clone())
            .or_insert_with(|| builder.edges.get(id).cloned().unwrap_or_default());
    }

    Ok(CompiledGraph {
        nodes,
        flow,
        registry: builder.registry,
        recursion_limit: DEFAULT_RECURSION_LIMIT,
        store: None,
        cancellation: None,
        retry: None,
    })
}

fn validate(builder: &StateGraph) -> Result<()> {
    if let Some(node) = builder.duplicates.first() {
        return Err(GraphError::DuplicateNode { node: node.clone() });
    }
    if !builder.edges.contains_key(START) {
        return Err(GraphError::invalid(format!(
            "no entry edge from '{START}'"
        )));
    }

    for (from, edges) in &builder.edges {
        if from != START && !builder.nodes.contains_key(from) {
            return Err(GraphError::invalid(format!(
                "edge declared from undefined node '{from}'"
            )));
        }
        let mut direct = 0usize;
        let mut conditional = 0usize;
        for edge in edges {
            match edge {
                Edge::Direct(to) => {
                    direct += 1;
                    check_target(builder, from, to)?;
                }
                Edge::Conditional { targets, .. } => {
                    conditional += 1;
                    for to in targets.values() {
                        check_target(builder, from, to)?;
                    }
                }
            }
        }
        if conditional > 1 || (conditional == 1 && direct > 0) {
            return Err(GraphError::invalid(format!(
                "node '{from}' mixes conditional routing with other outgoing edges"
            )));
        }
    }

    for id in &builder.node_order {
        if !builder.edges.contains_key(id) {
            return Err(GraphError::MissingNode { node: id.clone() });
        }
    }
    Ok(())
}

fn check_target(builder: &StateGraph, from: &str, to: &str) -> Result<()> {
    if to == END || builder.nodes.contains_key(to) {
        Ok(())
    } else {
        Err(GraphError::DanglingEdge {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn direct_targets(builder: &StateGraph, node: &str) -> Vec<NodeId> {
    builder
        .edges
        .get(node)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| match edge {
                    Edge::Direct(to) => Some(to.clone()),
                    Edge::Conditional { .. } => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn has_conditional(builder: &StateGraph, node: &str) -> bool {
    builder
        .edges
        .get(node)
        .is_some_and(|edges| edges.iter().any(|e| matches!(e, Edge::Conditional { .. })))
}

/// Forward walk from `from`, jumping over nested fan-out regions.
///
/// The returned names are the convergence candidates this branch offers:
/// nodes on its spine, interior nodes of nested regions excluded. The walk
/// ends at END, at a node routed by a conditional edge, or when it would
/// revisit a node.
fn branch_names(
    builder: &StateGraph,
    from: &NodeId,
    stack: &mut HashSet<NodeId>,
) -> Result<Vec<NodeId>> {
    let mut names = Vec::new();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut current = from.clone();
    loop {
        if current == END {
            names.push(END.to_string());
            break;
        }
        if !seen.insert(current.clone()) {
            break;
        }
        names.push(current.clone());
        if has_conditional(builder, &current) {
            break;
        }
        let direct = direct_targets(builder, &current);
        match direct.len() {
            0 => break,
            1 => current = direct.into_iter().next().unwrap_or_default(),
            _ => current = region_join(builder, &current, stack)?,
        }
    }
    Ok(names)
}

/// First common convergence node of the fan-out at `source`
fn region_join(
    builder: &StateGraph,
    source: &NodeId,
    stack: &mut HashSet<NodeId>,
) -> Result<NodeId> {
    if !stack.insert(source.clone()) {
        return Err(GraphError::DivergentBranches {
            node: source.clone(),
        });
    }
    let successors = direct_targets(builder, source);
    let mut walks = Vec::with_capacity(successors.len());
    for successor in &successors {
        walks.push(branch_names(builder, successor, stack)?);
    }
    stack.remove(source);

    let (first, rest) = walks
        .split_first()
        .ok_or_else(|| GraphError::invalid(format!("no branches out of '{source}'")))?;
    for candidate in first {
        if rest.iter().all(|walk| walk.contains(candidate)) {
            return Ok(candidate.clone());
        }
    }
    Err(GraphError::DivergentBranches {
        node: source.clone(),
    })
}

/// Compile one branch: the nodes strictly between the branch head and the
/// region's convergence node
fn build_chain(
    builder: &StateGraph,
    from: &NodeId,
    join: &NodeId,
    consumed: &mut HashSet<NodeId>,
) -> Result<BranchChain> {
    let mut steps = Vec::new();
    let mut current = from.clone();
    while current != *join {
        let spec = builder.nodes.get(&current).ok_or_else(|| {
            GraphError::invalid(format!("parallel region references undefined node '{current}'"))
        })?;
        if spec.interrupt.is_some() {
            return Err(GraphError::invalid(format!(
                "interruptible node '{current}' cannot appear inside a parallel region"
            )));
        }
        consumed.insert(current.clone());
        steps.push(CompiledNode {
            id: current.clone(),
            kind: NodeKind::Simple {
                action: spec.action.clone(),
                interrupt: None,
            },
        });

        let direct = direct_targets(builder, &current);
        if direct.len() == 1 {
            current = direct.into_iter().next().unwrap_or_default();
        } else if direct.len() >= 2 {
            let (region, nested_join) = synthesize_region(builder, &current, consumed)?;
            steps.push(region);
            current = nested_join;
        } else {
            return Err(GraphError::invalid(format!(
                "node '{current}' has no static successor inside a parallel region"
            )));
        }
    }
    Ok(BranchChain { steps })
}

/// Synthesize the region node for the fan-out at `source`, consuming its
/// interior nodes. Returns the node and its convergence target.
fn synthesize_region(
    builder: &StateGraph,
    source: &NodeId,
    consumed: &mut HashSet<NodeId>,
) -> Result<(CompiledNode, NodeId)> {
    let mut stack = HashSet::new();
    let join = region_join(builder, source, &mut stack)?;

    let successors = direct_targets(builder, source);
    let mut branches = Vec::with_capacity(successors.len());
    for successor in &successors {
        branches.push(build_chain(builder, successor, &join, consumed)?);
    }

    let flat = branches.iter().all(|branch| {
        branch.steps.len() <= 2
            && branch
                .steps
                .iter()
                .all(|step| matches!(step.kind, NodeKind::Simple { .. }))
    });

    let id = parallel_id(source);
    let kind = if flat {
        NodeKind::ParallelJoin {
            branches,
            join: join.clone(),
        }
    } else {
        NodeKind::SubGraph {
            graph: Box::new(NestedGraph { branches }),
            join: join.clone(),
        }
    };
    Ok((CompiledNode { id, kind }, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::review_items_under;
    use serde_json::json;

    fn graph_with(nodes: &[&str]) -> StateGraph {
        let mut graph = StateGraph::new();
        for id in nodes {
            graph.add_node(*id, |_| Box::pin(async { Ok(json!({})) }));
        }
        graph
    }

    #[test]
    fn test_linear_graph_compiles_one_to_one() {
        let mut graph = graph_with(&["a", "b"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END);
        let compiled = graph.compile().unwrap();

        assert_eq!(compiled.nodes.len(), 2);
        assert!(compiled.node_ids().all(|id| !id.starts_with("__PARALLEL__")));
        assert!(matches!(
            compiled.node("a").unwrap().kind,
            NodeKind::Simple { .. }
        ));
    }

    #[test]
    fn test_short_branches_become_parallel_join() {
        let mut graph = graph_with(&["a", "b", "c", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "c")
            .add_edge("b", "z")
            .add_edge("c", "z")
            .add_edge("z", END);
        let compiled = graph.compile().unwrap();

        let region = compiled.node("__PARALLEL__(a)").unwrap();
        match &region.kind {
            NodeKind::ParallelJoin { branches, join } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[0].steps[0].id, "b");
                assert_eq!(branches[1].steps[0].id, "c");
                assert_eq!(join, "z");
            }
            _ => panic!("expected a flat parallel join"),
        }

        // Interior nodes are absorbed into the region.
        assert!(compiled.node("b").is_none());
        assert!(compiled.node("c").is_none());

        // a -> __PARALLEL__(a) -> z
        assert!(matches!(
            compiled.edges_from("a"),
            Some([Edge::Direct(to)]) if to == "__PARALLEL__(a)"
        ));
        assert!(matches!(
            compiled.edges_from("__PARALLEL__(a)"),
            Some([Edge::Direct(to)]) if to == "z"
        ));
    }

    #[test]
    fn test_two_node_branch_stays_flat() {
        let mut graph = graph_with(&["a", "b1", "b2", "c", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b1")
            .add_edge("a", "c")
            .add_edge("b1", "b2")
            .add_edge("b2", "z")
            .add_edge("c", "z")
            .add_edge("z", END);
        let compiled = graph.compile().unwrap();

        match &compiled.node("__PARALLEL__(a)").unwrap().kind {
            NodeKind::ParallelJoin { branches, .. } => {
                assert_eq!(branches[0].steps.len(), 2);
                assert_eq!(branches[1].steps.len(), 1);
            }
            _ => panic!("expected a flat parallel join"),
        }
    }

    #[test]
    fn test_long_branch_becomes_sub_graph() {
        let mut graph = graph_with(&["a", "b1", "b2", "b3", "c", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b1")
            .add_edge("a", "c")
            .add_edge("b1", "b2")
            .add_edge("b2", "b3")
            .add_edge("b3", "z")
            .add_edge("c", "z")
            .add_edge("z", END);
        let compiled = graph.compile().unwrap();

        match &compiled.node("__PARALLEL__(a)").unwrap().kind {
            NodeKind::SubGraph { graph, join } => {
                assert_eq!(graph.branches.len(), 2);
                assert_eq!(graph.branches[0].steps.len(), 3);
                assert_eq!(join, "z");
            }
            _ => panic!("expected a sub-graph node"),
        }
    }

    #[test]
    fn test_branch_straight_to_join_is_allowed() {
        let mut graph = graph_with(&["a", "b", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "z")
            .add_edge("b", "z")
            .add_edge("z", END);
        let compiled = graph.compile().unwrap();

        match &compiled.node("__PARALLEL__(a)").unwrap().kind {
            NodeKind::ParallelJoin { branches, .. } => {
                assert_eq!(branches[0].steps.len(), 1);
                assert!(branches[1].steps.is_empty());
            }
            _ => panic!("expected a flat parallel join"),
        }
    }

    #[test]
    fn test_nested_fan_out_compiles_recursively() {
        // a fans out to {b, e}; b fans out to {c, d}; all reconverge on z.
        let mut graph = graph_with(&["a", "b", "c", "d", "e", "j", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "e")
            .add_edge("b", "c")
            .add_edge("b", "d")
            .add_edge("c", "j")
            .add_edge("d", "j")
            .add_edge("j", "z")
            .add_edge("e", "z")
            .add_edge("z", END);
        let compiled = graph.compile().unwrap();

        match &compiled.node("__PARALLEL__(a)").unwrap().kind {
            NodeKind::SubGraph { graph, join } => {
                assert_eq!(join, "z");
                // branch through b: [b, __PARALLEL__(b), j]
                let spine = &graph.branches[0].steps;
                assert_eq!(spine[0].id, "b");
                assert_eq!(spine[1].id, "__PARALLEL__(b)");
                assert!(matches!(spine[1].kind, NodeKind::ParallelJoin { .. }));
                assert_eq!(spine[2].id, "j");
            }
            _ => panic!("expected a sub-graph node"),
        }
    }

    #[test]
    fn test_divergent_branches_fail_compile() {
        // b routes conditionally before any reconvergence; c runs to z.
        let mut graph = graph_with(&["a", "b", "c", "x", "z"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "c")
            .add_conditional_edge(
                "b",
                Arc::new(|_| "out".to_string()),
                HashMap::from([("out".to_string(), "x".to_string())]),
            )
            .add_edge("x", END)
            .add_edge("c", "z")
            .add_edge("z", END);
        assert!(matches!(
            graph.compile(),
            Err(GraphError::DivergentBranches { node }) if node == "a"
        ));
    }

    #[test]
    fn test_branches_may_reconverge_on_end() {
        let mut graph = graph_with(&["a", "b", "c"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "c")
            .add_edge("b", END)
            .add_edge("c", END);
        let compiled = graph.compile().unwrap();

        match &compiled.node("__PARALLEL__(a)").unwrap().kind {
            NodeKind::ParallelJoin { join, .. } => assert_eq!(join, END),
            _ => panic!("expected a flat parallel join"),
        }
    }

    #[test]
    fn test_interruptible_node_inside_region_is_rejected() {
        let mut graph = graph_with(&["a", "c", "z"]);
        graph.add_node_with_interrupt(
            "b",
            |_| Box::pin(async { Ok(json!({})) }),
            review_items_under("actions"),
        );
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("a", "c")
            .add_edge("b", "z")
            .add_edge("c", "z")
            .add_edge("z", END);
        assert!(matches!(graph.compile(), Err(GraphError::InvalidGraph(_))));
    }

    #[test]
    fn test_mixed_edges_on_one_node_are_rejected() {
        let mut graph = graph_with(&["a", "b"]);
        graph
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_conditional_edge(
                "a",
                Arc::new(|_| "x".to_string()),
                HashMap::from([("x".to_string(), "b".to_string())]),
            )
            .add_edge("b", END);
        assert!(matches!(graph.compile(), Err(GraphError::InvalidGraph(_))));
    }
}
