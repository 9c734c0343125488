//! Workflow graph nodes.
//!
//! A committed workflow is a tree of `GraphNode`s. Loop constructs express
//! repetition as explicit nodes rather than back-edges, so the structure is
//! acyclic by construction. Predicates and step execute functions are
//! referenced by identifier only, so the tree serializes cleanly and the
//! callables are re-supplied through a registry when a scheduler is built.
//!
//! Node ids are unique within a definition. The `@` character is reserved:
//! the executor suffixes body node ids with `@<index>` when fanning a
//! for-each out over its items, so per-index progress lands under distinct
//! keys in the run snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shape::ValueShape;

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// Declaration of a single step: its id and input/output shapes.
///
/// The execute function is not part of the declaration; it is registered separately
/// under the same id so definitions remain durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id, unique within a definition.
    pub id: String,
    /// Shape the execute function expects as input.
    #[serde(default)]
    pub input_shape: ValueShape,
    /// Shape the execute function produces on success.
    #[serde(default)]
    pub output_shape: ValueShape,
}

impl StepSpec {
    /// Declare a step with explicit input/output shapes.
    pub fn new(id: impl Into<String>, input_shape: ValueShape, output_shape: ValueShape) -> Self {
        Self {
            id: id.into(),
            input_shape,
            output_shape,
        }
    }

    /// Declare a step that accepts and produces any JSON value.
    pub fn untyped(id: impl Into<String>) -> Self {
        Self::new(id, ValueShape::Any, ValueShape::Any)
    }

    /// The registry key for this step's execute function.
    ///
    /// Strips any `@<index>` iteration scope appended by the executor.
    pub fn handler_key(&self) -> &str {
        handler_key(&self.id)
    }
}

/// Strip the iteration scope (`@<index>` suffix) from a node id.
pub fn handler_key(id: &str) -> &str {
    match id.find('@') {
        Some(pos) => &id[..pos],
        None => id,
    }
}

// ---------------------------------------------------------------------------
// GraphNode
// ---------------------------------------------------------------------------

/// One arm of a branch node: a named predicate paired with the node to run
/// when the predicate is the first to evaluate true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    /// Registered predicate name, evaluated against the branch input.
    pub predicate: String,
    /// Node executed when this arm is selected.
    pub node: GraphNode,
}

/// Kind discriminant for plan lowering and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    Sequence,
    Parallel,
    Branch,
    DoWhile,
    DoUntil,
    ForEach,
    Map,
}

/// A node in a committed workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphNode {
    /// A single unit of work.
    Step { step: StepSpec },
    /// Children executed in order, each fed the previous output.
    Sequence { id: String, children: Vec<GraphNode> },
    /// Children executed concurrently; output is the array of child outputs
    /// in declared order.
    Parallel { id: String, children: Vec<GraphNode> },
    /// First arm whose predicate evaluates true runs; no match passes the
    /// input through unchanged.
    Branch { id: String, arms: Vec<BranchArm> },
    /// Body runs at least once, then repeats while the predicate holds.
    DoWhile {
        id: String,
        body: Box<GraphNode>,
        predicate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Body runs at least once, then repeats until the predicate holds.
    DoUntil {
        id: String,
        body: Box<GraphNode>,
        predicate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Body applied to each element of an ordered item sequence. Items come
    /// from the node's input array unless a static list is declared.
    ForEach {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Vec<Value>>,
        body: Box<GraphNode>,
    },
    /// A step applied to each element of the input array.
    Map { id: String, step: StepSpec },
}

impl GraphNode {
    /// Wrap a step spec as a graph node.
    pub fn step(spec: StepSpec) -> Self {
        GraphNode::Step { step: spec }
    }

    /// This node's id, unique within its definition.
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Step { step } => &step.id,
            GraphNode::Sequence { id, .. }
            | GraphNode::Parallel { id, .. }
            | GraphNode::Branch { id, .. }
            | GraphNode::DoWhile { id, .. }
            | GraphNode::DoUntil { id, .. }
            | GraphNode::ForEach { id, .. }
            | GraphNode::Map { id, .. } => id,
        }
    }

    /// Kind discriminant.
    pub fn kind(&self) -> NodeKind {
        match self {
            GraphNode::Step { .. } => NodeKind::Step,
            GraphNode::Sequence { .. } => NodeKind::Sequence,
            GraphNode::Parallel { .. } => NodeKind::Parallel,
            GraphNode::Branch { .. } => NodeKind::Branch,
            GraphNode::DoWhile { .. } => NodeKind::DoWhile,
            GraphNode::DoUntil { .. } => NodeKind::DoUntil,
            GraphNode::ForEach { .. } => NodeKind::ForEach,
            GraphNode::Map { .. } => NodeKind::Map,
        }
    }

    /// Shape this node expects as input.
    pub fn input_shape(&self) -> ValueShape {
        match self {
            GraphNode::Step { step } => step.input_shape,
            GraphNode::Sequence { children, .. } => children
                .first()
                .map(GraphNode::input_shape)
                .unwrap_or(ValueShape::Any),
            // Parallel fans the same input to every child; Branch arms may
            // disagree, so both stay open.
            GraphNode::Parallel { .. } | GraphNode::Branch { .. } => ValueShape::Any,
            GraphNode::DoWhile { body, .. } | GraphNode::DoUntil { body, .. } => {
                body.input_shape()
            }
            GraphNode::ForEach { items, .. } => {
                if items.is_some() {
                    ValueShape::Any
                } else {
                    ValueShape::Array
                }
            }
            GraphNode::Map { .. } => ValueShape::Array,
        }
    }

    /// Shape this node produces.
    pub fn output_shape(&self) -> ValueShape {
        match self {
            GraphNode::Step { step } => step.output_shape,
            GraphNode::Sequence { children, .. } => children
                .last()
                .map(GraphNode::output_shape)
                .unwrap_or(ValueShape::Any),
            GraphNode::Parallel { .. } => ValueShape::Array,
            GraphNode::Branch { .. } => ValueShape::Any,
            GraphNode::DoWhile { body, .. } | GraphNode::DoUntil { body, .. } => {
                body.output_shape()
            }
            GraphNode::ForEach { .. } | GraphNode::Map { .. } => ValueShape::Array,
        }
    }

    /// Visit this node and every descendant, depth-first.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a GraphNode)) {
        f(self);
        match self {
            GraphNode::Step { .. } | GraphNode::Map { .. } => {}
            GraphNode::Sequence { children, .. } | GraphNode::Parallel { children, .. } => {
                for child in children {
                    child.visit(f);
                }
            }
            GraphNode::Branch { arms, .. } => {
                for arm in arms {
                    arm.node.visit(f);
                }
            }
            GraphNode::DoWhile { body, .. }
            | GraphNode::DoUntil { body, .. }
            | GraphNode::ForEach { body, .. } => body.visit(f),
        }
    }

    /// All node ids in this subtree, depth-first.
    pub fn collect_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.visit(&mut |node| ids.push(node.id().to_string()));
        ids
    }

    /// Clone this subtree with every node id suffixed by `@<scope>`.
    ///
    /// Used by the executor to give each for-each iteration its own id
    /// space, so per-index outputs never collide in the run snapshot.
    pub fn with_scoped_ids(&self, scope: &str) -> GraphNode {
        let mut node = self.clone();
        node.scope_ids(scope);
        node
    }

    fn scope_ids(&mut self, scope: &str) {
        match self {
            GraphNode::Step { step } => step.id = format!("{}@{scope}", step.id),
            GraphNode::Sequence { id, children } | GraphNode::Parallel { id, children } => {
                *id = format!("{id}@{scope}");
                for child in children {
                    child.scope_ids(scope);
                }
            }
            GraphNode::Branch { id, arms } => {
                *id = format!("{id}@{scope}");
                for arm in arms {
                    arm.node.scope_ids(scope);
                }
            }
            GraphNode::DoWhile { id, body, .. } | GraphNode::DoUntil { id, body, .. } => {
                *id = format!("{id}@{scope}");
                body.scope_ids(scope);
            }
            GraphNode::ForEach { id, body, .. } => {
                *id = format!("{id}@{scope}");
                body.scope_ids(scope);
            }
            GraphNode::Map { id, step } => {
                *id = format!("{id}@{scope}");
                step.id = format!("{}@{scope}", step.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
