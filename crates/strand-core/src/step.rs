//! The step execute contract.
//!
//! A step's execute function receives the resolved input value plus a
//! read-only view of the run, and resolves to an outcome: produce an output,
//! or suspend the whole run with a payload. Failures are ordinary `Err`
//! returns; the executor translates them into a failed run.
//!
//! Handlers live behind `dyn StepHandler` inside the registry, so the trait
//! returns a boxed future rather than an anonymous `impl Future`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure raised by a step's execute function.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepError {
    /// Human-readable failure detail, recorded on the failed run.
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a step's execute function resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished and produced this value.
    Output(Value),
    /// The step requests suspension of the run. The payload is persisted in
    /// the snapshot and surfaced to watchers; execution stops here until
    /// `resume` is called.
    Suspend(Value),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read-only view of the run handed to each execute function.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Id of the run this invocation belongs to.
    pub run_id: Uuid,
    /// Iteration-scoped id of the executing step node.
    pub step_id: String,
    /// Outputs of previously completed nodes, keyed by node id.
    pub outputs: Arc<HashMap<String, Value>>,
    /// The resume payload, present exactly once: on the first invocation
    /// after a resume targeted this step.
    pub resume_payload: Option<Value>,
}

impl StepContext {
    /// Output of a previously completed node, if recorded.
    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A step's execute function.
///
/// Implementations must be cheap to share; the registry holds them in an
/// `Arc` and the executor may invoke the same handler concurrently for
/// different runs or for-each indices.
pub trait StepHandler: Send + Sync {
    fn execute(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> BoxFuture<'static, Result<StepOutcome, StepError>>;
}

/// Adapter so plain async closures register without a named type.
pub(crate) struct FnHandler<F>(pub F);

impl<F> StepHandler for FnHandler<F>
where
    F: Fn(Value, StepContext) -> BoxFuture<'static, Result<StepOutcome, StepError>>
        + Send
        + Sync,
{
    fn execute(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> BoxFuture<'static, Result<StepOutcome, StepError>> {
        (self.0)(input, ctx)
    }
}
