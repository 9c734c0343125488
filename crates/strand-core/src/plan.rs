//! Traversal-plan lowering and structural validation.
//!
//! Uses `petgraph` to model the committed node tree as a directed graph.
//! Containment edges run parent-to-child; ordering edges run between
//! consecutive sequence children. Topological sort verifies the plan is
//! acyclic, and node-id collection verifies uniqueness across the whole
//! graph. Both checks run once, at commit time; builder misuse never
//! surfaces at run time.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use strand_types::definition::{PlanNode, TraversalPlan};
use strand_types::graph::GraphNode;

use crate::builder::BuildError;

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

/// Flatten a node tree into a serializable traversal plan.
pub fn lower(root: &GraphNode) -> TraversalPlan {
    let mut plan = TraversalPlan::default();
    lower_into(root, &mut plan);
    plan
}

fn lower_into(node: &GraphNode, plan: &mut TraversalPlan) {
    plan.nodes.push(PlanNode {
        id: node.id().to_string(),
        kind: node.kind(),
    });

    match node {
        GraphNode::Step { .. } | GraphNode::Map { .. } => {}
        GraphNode::Sequence { id, children } => {
            if let Some(first) = children.first() {
                plan.edges.push((id.clone(), first.id().to_string()));
            }
            for pair in children.windows(2) {
                plan.edges
                    .push((pair[0].id().to_string(), pair[1].id().to_string()));
            }
            for child in children {
                lower_into(child, plan);
            }
        }
        GraphNode::Parallel { id, children } => {
            for child in children {
                plan.edges.push((id.clone(), child.id().to_string()));
                lower_into(child, plan);
            }
        }
        GraphNode::Branch { id, arms } => {
            for arm in arms {
                plan.edges.push((id.clone(), arm.node.id().to_string()));
                lower_into(&arm.node, plan);
            }
        }
        GraphNode::DoWhile { id, body, .. }
        | GraphNode::DoUntil { id, body, .. }
        | GraphNode::ForEach { id, body, .. } => {
            plan.edges.push((id.clone(), body.id().to_string()));
            lower_into(body, plan);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a traversal plan: unique node ids and an acyclic edge set.
pub fn validate(plan: &TraversalPlan) -> Result<(), BuildError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();

    for node in &plan.nodes {
        if indices.contains_key(node.id.as_str()) {
            return Err(BuildError::DuplicateNodeId(node.id.clone()));
        }
        let idx = graph.add_node(node.id.as_str());
        indices.insert(node.id.as_str(), idx);
    }

    for (from, to) in &plan.edges {
        let from_idx = indices
            .get(from.as_str())
            .ok_or_else(|| BuildError::Validation(format!("edge from unknown node '{from}'")))?;
        let to_idx = indices
            .get(to.as_str())
            .ok_or_else(|| BuildError::Validation(format!("edge to unknown node '{to}'")))?;
        graph.add_edge(*from_idx, *to_idx, ());
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        BuildError::CycleDetected(node_id.to_string())
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
