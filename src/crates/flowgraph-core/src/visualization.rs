//! Mermaid rendering of compiled graphs
//!
//! [`CompiledGraph::to_mermaid`] renders the *compiled* structure, fan-out
//! regions included, so what you see is exactly what the engine executes.
//! Nodes get stable `n0`, `n1`, ... identifiers with the original ids as
//! quoted labels; regions render as `subgraph` blocks; conditional edges
//! carry their route label. Output is emitted in sorted order, so renders
//! diff cleanly across compilations.

use crate::compile::{BranchChain, CompiledGraph, CompiledNode, NodeKind};
use crate::graph::{Edge, END, START};
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Default)]
struct MermaidIds {
    assigned: HashMap<String, String>,
    next: usize,
}

impl MermaidIds {
    /// Mermaid identifier for a node, allocating on first sight. The flag
    /// reports whether the id is fresh and still needs a declaration.
    fn get(&mut self, node: &str) -> (String, bool) {
        if let Some(id) = self.assigned.get(node) {
            return (id.clone(), false);
        }
        let id = format!("n{}", self.next);
        self.next += 1;
        self.assigned.insert(node.to_string(), id.clone());
        (id, true)
    }
}

fn label(node: &str) -> String {
    node.replace('"', "'")
}

fn edge_ref(ids: &mut MermaidIds, node: &str) -> String {
    let (id, fresh) = ids.get(node);
    if fresh {
        format!("{id}[\"{}\"]", label(node))
    } else {
        id
    }
}

fn render_node(out: &mut String, ids: &mut MermaidIds, node: &CompiledNode, depth: usize) {
    let pad = "    ".repeat(depth);
    match &node.kind {
        NodeKind::Simple { .. } => {
            let (id, _) = ids.get(&node.id);
            let _ = writeln!(out, "{pad}{id}[\"{}\"]", label(&node.id));
        }
        NodeKind::ParallelJoin { branches, .. } => {
            render_subgraph(out, ids, &node.id, branches, depth);
        }
        NodeKind::SubGraph { graph, .. } => {
            render_subgraph(out, ids, &node.id, &graph.branches, depth);
        }
    }
}

fn render_subgraph(
    out: &mut String,
    ids: &mut MermaidIds,
    id: &str,
    branches: &[BranchChain],
    depth: usize,
) {
    let pad = "    ".repeat(depth);
    let (sub_id, _) = ids.get(id);
    let _ = writeln!(out, "{pad}subgraph {sub_id}[\"{}\"]", label(id));
    let _ = writeln!(out, "{pad}    direction TB");
    for branch in branches {
        let mut prev: Option<String> = None;
        for step in &branch.steps {
            render_node(out, ids, step, depth + 1);
            let (step_id, _) = ids.get(&step.id);
            if let Some(prev_id) = prev {
                let _ = writeln!(out, "{pad}    {prev_id} --> {step_id}");
            }
            prev = Some(step_id);
        }
    }
    let _ = writeln!(out, "{pad}end");
}

impl CompiledGraph {
    /// Render the compiled graph as a Mermaid `flowchart TD`.
    pub fn to_mermaid(&self) -> String {
        let mut ids = MermaidIds::default();
        ids.assigned
            .insert(START.to_string(), "__start__".to_string());
        ids.assigned.insert(END.to_string(), "__end__".to_string());

        let mut out = String::from("flowchart TD\n");
        let _ = writeln!(out, "    __start__([\"{START}\"])");
        let _ = writeln!(out, "    __end__([\"{END}\"])");

        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort_unstable();
        for name in names {
            render_node(&mut out, &mut ids, &self.nodes[name], 1);
        }

        let mut froms: Vec<&String> = self.flow.keys().collect();
        froms.sort_unstable();
        for from in froms {
            let (from_id, _) = ids.get(from);
            for edge in &self.flow[from.as_str()] {
                match edge {
                    Edge::Direct(to) => {
                        let target = edge_ref(&mut ids, to);
                        let _ = writeln!(out, "    {from_id} --> {target}");
                    }
                    Edge::Conditional { targets, .. } => {
                        let mut routes: Vec<&String> = targets.keys().collect();
                        routes.sort_unstable();
                        for route in routes {
                            let target = edge_ref(&mut ids, &targets[route.as_str()]);
                            let _ =
                                writeln!(out, "    {from_id} -->|{}| {target}", label(route));
                        }
                    }
                }
            }
        }
        out
    }
}
