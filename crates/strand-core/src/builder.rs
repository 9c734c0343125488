//! Fluent workflow builder with an immutable commit pass.
//!
//! The builder accumulates an explicit tagged-node tree (never a live
//! mutable object graph) and `commit()` freezes it into an `Arc<Definition>`
//! shared by every run. All misuse (duplicate ids, shape mismatches,
//! structural problems) surfaces synchronously at build time; a committed
//! definition is structurally valid by construction.
//!
//! Builder errors are deliberately split from executor errors: nothing in
//! this module can occur once a definition exists.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use strand_types::definition::Definition;
use strand_types::graph::{BranchArm, GraphNode, StepSpec};
use strand_types::shape::ValueShape;
use thiserror::Error;
use uuid::Uuid;

use crate::plan;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or committing a workflow graph.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A step was declared with an empty id.
    #[error("step id must not be empty")]
    EmptyStepId,

    /// A step id contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid step id '{0}' (alphanumeric, '-' and '_' only)")]
    InvalidStepId(String),

    /// The same step id was added twice within one graph.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// Two nodes ended up with the same id after lowering.
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    /// Mutation or a second commit was attempted after `commit()`.
    #[error("graph already committed")]
    AlreadyCommitted,

    /// Adjacent steps declare incompatible shapes.
    #[error(
        "shape mismatch: '{from}' outputs {output:?} but '{to}' expects {input:?}"
    )]
    ShapeMismatch {
        from: String,
        to: String,
        output: ValueShape,
        input: ValueShape,
    },

    /// The traversal plan contains a cycle (should be unreachable for
    /// builder-produced trees; guards hand-assembled nodes).
    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    /// Other structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// YAML/JSON parse failure when loading a definition.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Mutable builder that assembles steps into a workflow graph.
///
/// Combinators consume and return the builder so chains read linearly:
///
/// ```
/// use strand_core::builder::WorkflowBuilder;
/// use strand_types::graph::{GraphNode, StepSpec};
///
/// let definition = WorkflowBuilder::new("double-then-sum")
///     .then(StepSpec::untyped("double"))
///     .unwrap()
///     .parallel(vec![
///         GraphNode::step(StepSpec::untyped("left")),
///         GraphNode::step(StepSpec::untyped("right")),
///     ])
///     .unwrap()
///     .commit()
///     .unwrap();
/// assert_eq!(definition.name, "double-then-sum");
/// ```
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    version: String,
    input_shape: ValueShape,
    output_shape: ValueShape,
    segments: Vec<GraphNode>,
    seen: HashSet<String>,
    committed: bool,
    auto: u32,
}

impl WorkflowBuilder {
    /// Open a builder for a named workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            input_shape: ValueShape::Any,
            output_shape: ValueShape::Any,
            segments: Vec::new(),
            seen: HashSet::new(),
            committed: false,
            auto: 0,
        }
    }

    /// Set the semantic version recorded on the definition.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Declare the shape the run input must satisfy.
    pub fn input_shape(mut self, shape: ValueShape) -> Self {
        self.input_shape = shape;
        self
    }

    /// Declare the shape of the final output.
    pub fn output_shape(mut self, shape: ValueShape) -> Self {
        self.output_shape = shape;
        self
    }

    // -----------------------------------------------------------------------
    // Combinators
    // -----------------------------------------------------------------------

    /// Append a step, sequenced after everything added so far.
    pub fn then(mut self, step: StepSpec) -> Result<Self, BuildError> {
        self.guard()?;
        self.claim(&step.id)?;
        self.segments.push(GraphNode::step(step));
        Ok(self)
    }

    /// Fan out to children that all must complete before the chain
    /// advances. Output is the array of child outputs in declared order.
    pub fn parallel(
        mut self,
        children: impl IntoIterator<Item = GraphNode>,
    ) -> Result<Self, BuildError> {
        self.guard()?;
        let children: Vec<GraphNode> = children.into_iter().collect();
        for child in &children {
            self.claim_subtree(child)?;
        }
        let id = self.auto_id("parallel");
        self.segments.push(GraphNode::Parallel { id, children });
        Ok(self)
    }

    /// Conditional branch: predicates evaluate in declaration order at run
    /// time and the first true arm executes. Zero matches pass the input
    /// through unchanged.
    pub fn branch<P: Into<String>>(
        mut self,
        arms: impl IntoIterator<Item = (P, GraphNode)>,
    ) -> Result<Self, BuildError> {
        self.guard()?;
        let arms: Vec<BranchArm> = arms
            .into_iter()
            .map(|(predicate, node)| BranchArm {
                predicate: predicate.into(),
                node,
            })
            .collect();
        for arm in &arms {
            self.claim_subtree(&arm.node)?;
        }
        let id = self.auto_id("branch");
        self.segments.push(GraphNode::Branch { id, arms });
        Ok(self)
    }

    /// Execute `body` at least once, then repeat while the named predicate
    /// evaluates true against the latest body output.
    pub fn do_while(
        mut self,
        body: GraphNode,
        predicate: impl Into<String>,
        max_iterations: Option<u32>,
    ) -> Result<Self, BuildError> {
        self.guard()?;
        self.claim_subtree(&body)?;
        let id = self.auto_id("do_while");
        self.segments.push(GraphNode::DoWhile {
            id,
            body: Box::new(body),
            predicate: predicate.into(),
            max_iterations,
        });
        Ok(self)
    }

    /// Execute `body` at least once, then repeat until the named predicate
    /// evaluates true against the latest body output.
    pub fn do_until(
        mut self,
        body: GraphNode,
        predicate: impl Into<String>,
        max_iterations: Option<u32>,
    ) -> Result<Self, BuildError> {
        self.guard()?;
        self.claim_subtree(&body)?;
        let id = self.auto_id("do_until");
        self.segments.push(GraphNode::DoUntil {
            id,
            body: Box::new(body),
            predicate: predicate.into(),
            max_iterations,
        });
        Ok(self)
    }

    /// Apply a step to each element of an ordered item sequence. Items are
    /// taken from the node's input array unless a static list is given.
    /// Iterations run concurrently; aggregated output preserves item order.
    pub fn for_each(
        mut self,
        items: Option<Vec<Value>>,
        step: StepSpec,
    ) -> Result<Self, BuildError> {
        self.guard()?;
        self.claim(&step.id)?;
        let id = self.auto_id("for_each");
        self.segments.push(GraphNode::ForEach {
            id,
            items,
            body: Box::new(GraphNode::step(step)),
        });
        Ok(self)
    }

    /// Apply a step to each element of the input array.
    pub fn map(mut self, step: StepSpec) -> Result<Self, BuildError> {
        self.guard()?;
        self.claim(&step.id)?;
        let id = self.auto_id("map");
        self.segments.push(GraphNode::Map { id, step });
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Freeze the builder into an immutable definition.
    ///
    /// Runs the full validation pass: name format, shape compatibility
    /// between chained nodes, id uniqueness across the whole graph, and
    /// acyclicity of the lowered traversal plan. Any further call on this
    /// builder fails with `AlreadyCommitted`.
    pub fn commit(&mut self) -> Result<Arc<Definition>, BuildError> {
        if self.committed {
            return Err(BuildError::AlreadyCommitted);
        }
        self.committed = true;

        validate_name(&self.name)?;
        if self.segments.is_empty() {
            return Err(BuildError::Validation(
                "workflow must have at least one step".to_string(),
            ));
        }

        let root = if self.segments.len() == 1 {
            self.segments.remove(0)
        } else {
            let id = self.unique_id("root");
            GraphNode::Sequence {
                id,
                children: std::mem::take(&mut self.segments),
            }
        };

        check_shapes(&root)?;

        // Definition input feeds the root; root output is the final output.
        if !root.input_shape().accepts(self.input_shape) {
            return Err(BuildError::ShapeMismatch {
                from: "<input>".to_string(),
                to: root.id().to_string(),
                output: self.input_shape,
                input: root.input_shape(),
            });
        }
        if !self.output_shape.accepts(root.output_shape()) {
            return Err(BuildError::ShapeMismatch {
                from: root.id().to_string(),
                to: "<output>".to_string(),
                output: root.output_shape(),
                input: self.output_shape,
            });
        }

        let plan = plan::lower(&root);
        plan::validate(&plan)?;

        Ok(Arc::new(Definition {
            id: Uuid::now_v7(),
            name: self.name.clone(),
            version: self.version.clone(),
            input_shape: self.input_shape,
            output_shape: self.output_shape,
            root,
        }))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn guard(&self) -> Result<(), BuildError> {
        if self.committed {
            Err(BuildError::AlreadyCommitted)
        } else {
            Ok(())
        }
    }

    /// Register a step id, rejecting empty, malformed and duplicate ids.
    fn claim(&mut self, id: &str) -> Result<(), BuildError> {
        if id.is_empty() {
            return Err(BuildError::EmptyStepId);
        }
        // '@' is reserved for iteration scoping.
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BuildError::InvalidStepId(id.to_string()));
        }
        if !self.seen.insert(id.to_string()) {
            return Err(BuildError::DuplicateStepId(id.to_string()));
        }
        Ok(())
    }

    /// Register every node id in a caller-supplied subtree.
    fn claim_subtree(&mut self, node: &GraphNode) -> Result<(), BuildError> {
        for id in node.collect_ids() {
            self.claim(&id)?;
        }
        Ok(())
    }

    /// Generate a fresh id for a combinator node.
    fn auto_id(&mut self, kind: &str) -> String {
        loop {
            self.auto += 1;
            let id = format!("{kind}-{}", self.auto);
            if self.seen.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Use `base` as an id if free, otherwise suffix it.
    fn unique_id(&mut self, base: &str) -> String {
        if self.seen.insert(base.to_string()) {
            return base.to_string();
        }
        self.auto_id(base)
    }
}

/// Workflow names: non-empty, alphanumeric plus hyphens and underscores.
fn validate_name(name: &str) -> Result<(), BuildError> {
    if name.is_empty() {
        return Err(BuildError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BuildError::Validation(format!(
            "workflow name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Check shape compatibility along every sequence and around loop bodies.
fn check_shapes(node: &GraphNode) -> Result<(), BuildError> {
    match node {
        GraphNode::Step { .. } | GraphNode::Map { .. } => Ok(()),
        GraphNode::Sequence { children, .. } => {
            for pair in children.windows(2) {
                let output = pair[0].output_shape();
                let input = pair[1].input_shape();
                if !input.accepts(output) {
                    return Err(BuildError::ShapeMismatch {
                        from: pair[0].id().to_string(),
                        to: pair[1].id().to_string(),
                        output,
                        input,
                    });
                }
            }
            for child in children {
                check_shapes(child)?;
            }
            Ok(())
        }
        GraphNode::Parallel { children, .. } => {
            for child in children {
                check_shapes(child)?;
            }
            Ok(())
        }
        GraphNode::Branch { arms, .. } => {
            for arm in arms {
                check_shapes(&arm.node)?;
            }
            Ok(())
        }
        GraphNode::DoWhile { id, body, .. } | GraphNode::DoUntil { id, body, .. } => {
            // Body output feeds the next iteration's input.
            if !body.input_shape().accepts(body.output_shape()) {
                return Err(BuildError::ShapeMismatch {
                    from: id.clone(),
                    to: body.id().to_string(),
                    output: body.output_shape(),
                    input: body.input_shape(),
                });
            }
            check_shapes(body)
        }
        GraphNode::ForEach { body, .. } => check_shapes(body),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::graph::NodeKind;

    fn untyped(id: &str) -> StepSpec {
        StepSpec::untyped(id)
    }

    #[test]
    fn linear_chain_commits() {
        let def = WorkflowBuilder::new("chain")
            .then(untyped("a"))
            .unwrap()
            .then(untyped("b"))
            .unwrap()
            .commit()
            .unwrap();
        assert_eq!(def.name, "chain");
        assert_eq!(def.root.collect_ids(), vec!["root", "a", "b"]);
    }

    #[test]
    fn single_segment_skips_root_wrapper() {
        let def = WorkflowBuilder::new("solo")
            .then(untyped("only"))
            .unwrap()
            .commit()
            .unwrap();
        assert_eq!(def.root.kind(), NodeKind::Step);
        assert_eq!(def.root.id(), "only");
    }

    #[test]
    fn duplicate_step_id_rejected_at_build_time() {
        let err = WorkflowBuilder::new("dup")
            .then(untyped("a"))
            .unwrap()
            .then(untyped("a"))
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn duplicate_across_combinators_rejected() {
        let err = WorkflowBuilder::new("dup")
            .then(untyped("a"))
            .unwrap()
            .parallel(vec![
                GraphNode::step(untyped("b")),
                GraphNode::step(untyped("a")),
            ])
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateStepId(_)));
    }

    #[test]
    fn empty_and_invalid_ids_rejected() {
        let err = WorkflowBuilder::new("w").then(untyped("")).unwrap_err();
        assert!(matches!(err, BuildError::EmptyStepId));

        let err = WorkflowBuilder::new("w")
            .then(untyped("bad id"))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidStepId(_)));

        // '@' is reserved for iteration scoping.
        let err = WorkflowBuilder::new("w")
            .then(untyped("step@0"))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidStepId(_)));
    }

    #[test]
    fn mutation_after_commit_fails() {
        let mut builder = WorkflowBuilder::new("frozen").then(untyped("a")).unwrap();
        builder.commit().unwrap();
        let err = builder.then(untyped("b")).unwrap_err();
        assert!(matches!(err, BuildError::AlreadyCommitted));
    }

    #[test]
    fn second_commit_fails() {
        let mut builder = WorkflowBuilder::new("once").then(untyped("a")).unwrap();
        builder.commit().unwrap();
        let err = builder.commit().unwrap_err();
        assert!(matches!(err, BuildError::AlreadyCommitted));
    }

    #[test]
    fn empty_workflow_rejected() {
        let err = WorkflowBuilder::new("empty").commit().unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[test]
    fn shape_mismatch_rejected_at_commit() {
        let err = WorkflowBuilder::new("typed")
            .then(StepSpec::new("parse", ValueShape::String, ValueShape::Object))
            .unwrap()
            .then(StepSpec::new("sum", ValueShape::Array, ValueShape::Number))
            .unwrap()
            .commit()
            .unwrap_err();
        match err {
            BuildError::ShapeMismatch { from, to, .. } => {
                assert_eq!(from, "parse");
                assert_eq!(to, "sum");
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn compatible_shapes_accepted() {
        let def = WorkflowBuilder::new("typed")
            .input_shape(ValueShape::String)
            .output_shape(ValueShape::Number)
            .then(StepSpec::new("parse", ValueShape::String, ValueShape::Array))
            .unwrap()
            .then(StepSpec::new("sum", ValueShape::Array, ValueShape::Number))
            .unwrap()
            .commit()
            .unwrap();
        assert_eq!(def.input_shape, ValueShape::String);
    }

    #[test]
    fn definition_input_shape_checked_against_first_step() {
        let err = WorkflowBuilder::new("typed")
            .input_shape(ValueShape::Number)
            .then(StepSpec::new("parse", ValueShape::String, ValueShape::Any))
            .unwrap()
            .commit()
            .unwrap_err();
        assert!(matches!(err, BuildError::ShapeMismatch { .. }));
    }

    #[test]
    fn loop_body_must_be_self_compatible() {
        let err = WorkflowBuilder::new("loopy")
            .do_while(
                GraphNode::step(StepSpec::new(
                    "poll",
                    ValueShape::String,
                    ValueShape::Number,
                )),
                "keep-going",
                None,
            )
            .unwrap()
            .commit()
            .unwrap_err();
        assert!(matches!(err, BuildError::ShapeMismatch { .. }));
    }

    #[test]
    fn invalid_workflow_name_rejected() {
        let err = WorkflowBuilder::new("bad name!")
            .then(untyped("a"))
            .unwrap()
            .commit()
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[test]
    fn auto_ids_do_not_collide_with_user_ids() {
        let def = WorkflowBuilder::new("w")
            .then(untyped("parallel-1"))
            .unwrap()
            .parallel(vec![GraphNode::step(untyped("x"))])
            .unwrap()
            .commit()
            .unwrap();
        let ids = def.root.collect_ids();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn branch_accepts_owned_predicate_names() {
        let names: Vec<String> = vec!["is-empty".to_string(), "is-large".to_string()];
        let def = WorkflowBuilder::new("dynamic")
            .branch(
                names
                    .into_iter()
                    .zip([
                        GraphNode::step(untyped("bail")),
                        GraphNode::step(untyped("compress")),
                    ]),
            )
            .unwrap()
            .commit()
            .unwrap();
        match &def.root {
            GraphNode::Branch { arms, .. } => {
                assert_eq!(arms[0].predicate, "is-empty");
                assert_eq!(arms[1].predicate, "is-large");
            }
            other => panic!("expected branch root, got {other:?}"),
        }
    }

    #[test]
    fn full_combinator_surface_commits() {
        let def = WorkflowBuilder::new("everything")
            .then(untyped("ingest"))
            .unwrap()
            .parallel(vec![
                GraphNode::step(untyped("left")),
                GraphNode::step(untyped("right")),
            ])
            .unwrap()
            .branch([
                ("is-empty", GraphNode::step(untyped("bail"))),
                ("is-large", GraphNode::step(untyped("compress"))),
            ])
            .unwrap()
            .do_until(GraphNode::step(untyped("poll")), "ready", Some(20))
            .unwrap()
            .for_each(None, untyped("enrich"))
            .unwrap()
            .map(untyped("format"))
            .unwrap()
            .commit()
            .unwrap();

        let plan = plan::lower(&def.root);
        assert!(plan.nodes.iter().any(|n| n.kind == NodeKind::Branch));
        assert!(plan.nodes.iter().any(|n| n.kind == NodeKind::ForEach));
        assert!(plan.nodes.iter().any(|n| n.kind == NodeKind::Map));
        plan::validate(&plan).unwrap();
    }
}
