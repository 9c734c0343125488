//! Committed workflow definitions and the flattened traversal plan.
//!
//! A `Definition` is the immutable output of the builder's commit pass. It
//! is shared (`Arc`) by every run derived from it and never mutated. The
//! `TraversalPlan` is a flat node/edge projection of the tree, serializable
//! alongside the definition so a scheduler's traversal order can be
//! reconstructed deterministically across process restarts; predicates and
//! execute functions are re-supplied by identifier at that point.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{GraphNode, NodeKind};
use crate::shape::ValueShape;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// An immutable, committed workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// UUIDv7 assigned at commit.
    pub id: Uuid,
    /// Workflow name (alphanumeric, hyphens, underscores).
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Shape the run input must satisfy.
    #[serde(default)]
    pub input_shape: ValueShape,
    /// Shape of the terminal node's output.
    #[serde(default)]
    pub output_shape: ValueShape,
    /// Root of the committed node tree.
    pub root: GraphNode,
}

// ---------------------------------------------------------------------------
// Traversal plan
// ---------------------------------------------------------------------------

/// One node in the flattened traversal plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub kind: NodeKind,
}

/// Flat projection of a definition's node tree.
///
/// Edges run parent-to-child for containment and between consecutive
/// sequence children for ordering. The edge list is what makes the plan a
/// checkable directed graph: commit runs a topological sort over it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraversalPlan {
    pub nodes: Vec<PlanNode>,
    /// `(from, to)` pairs of node ids.
    pub edges: Vec<(String, String)>,
}
