//! The scheduler: run creation, frontier traversal, suspension and resume.
//!
//! Execution is a recursive walk of the committed node tree. Each node
//! evaluates to either an output value or a suspension; the walk carries a
//! `RunContext` whose completed-set makes re-walks cheap. A resumed run
//! replays the same deterministic traversal and skips every node that
//! already recorded an output, so step execute functions run at most once
//! per resume cycle.
//!
//! Parallel fan-out uses a `JoinSet` per node with a shared semaphore
//! bounding concurrent step invocations. The first child failure aborts the
//! remaining siblings; on suspension, siblings run to completion and the
//! earliest-declared suspension wins.
//!
//! Snapshots are persisted at exactly two kinds of points: when a run
//! suspends, and when it reaches a terminal status. A mid-flight crash
//! therefore rewinds to the previous suspension, never to a torn state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use serde_json::Value;
use strand_types::definition::Definition;
use strand_types::event::RunEvent;
use strand_types::graph::{GraphNode, StepSpec};
use strand_types::run::RunStatus;
use strand_types::shape::ValueShape;
use strand_types::snapshot::{RunSnapshot, Suspension};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::context::{ContextError, RunContext};
use crate::registry::HandlerRegistry;
use crate::snapshot::{SnapshotError, SnapshotManager, SnapshotStore};
use crate::step::{StepContext, StepOutcome};
use crate::watch::{EventBus, RunWatcher};

/// Iteration cap applied when a loop declares no `max_iterations`.
const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 1000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The run input does not satisfy the definition's declared shape.
    #[error("input validation failed: expected {expected:?}, got {got:?}")]
    InputValidation {
        expected: ValueShape,
        got: ValueShape,
    },

    /// A step in the definition has no registered execute function.
    #[error("no handler registered for step '{0}'")]
    HandlerNotRegistered(String),

    /// A branch or loop references an unregistered predicate.
    #[error("no predicate registered under '{0}'")]
    PredicateNotRegistered(String),

    /// Resume found a snapshot whose definition was never registered with
    /// this scheduler.
    #[error("definition {0} is not registered")]
    DefinitionNotRegistered(Uuid),

    /// No snapshot exists for the run.
    #[error("no snapshot found for run {0}")]
    SnapshotNotFound(Uuid),

    /// The run already reached `Completed` or `Failed`.
    #[error("run {0} already finished")]
    RunAlreadyFinished(Uuid),

    /// The run is currently executing in this process.
    #[error("run {0} is already executing")]
    RunAlreadyResuming(Uuid),

    /// A step's execute function returned an error.
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// A step exceeded the per-step timeout.
    #[error("step '{step_id}' timed out")]
    StepTimeout { step_id: String },

    /// A loop hit its iteration cap while its condition still held.
    #[error("loop '{node_id}' still running after {iterations} iterations")]
    InfiniteLoopSuspected { node_id: String, iterations: u32 },

    /// The whole run exceeded the run timeout.
    #[error("run timed out")]
    RunTimeout,

    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("task join error: {0}")]
    Join(String),

    #[error(transparent)]
    Snapshot(SnapshotError),
}

impl From<SnapshotError> for ExecutorError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::NotFound(run_id) => ExecutorError::SnapshotNotFound(run_id),
            other => ExecutorError::Snapshot(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration, runs, results
// ---------------------------------------------------------------------------

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently executing step invocations per run.
    pub max_parallelism: usize,
    /// Wall-clock budget for one start or resume pass.
    pub run_timeout: Duration,
    /// Wall-clock budget for a single step invocation.
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            run_timeout: Duration::from_secs(30 * 60),
            step_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// A created-but-not-yet-started run.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub definition: Arc<Definition>,
    pub input: Value,
    pub status: RunStatus,
}

/// Outcome of one start or resume pass.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Final output, present when status is `Completed`.
    pub output: Option<Value>,
    /// Recorded node outputs at the end of the pass.
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct ActiveRun {
    cancel: CancellationToken,
}

/// Drives runs of committed definitions against a snapshot store.
pub struct Scheduler<S: SnapshotStore> {
    registry: Arc<HandlerRegistry>,
    snapshots: Arc<SnapshotManager<S>>,
    bus: EventBus,
    definitions: DashMap<Uuid, Arc<Definition>>,
    active: DashMap<Uuid, ActiveRun>,
    config: ExecutorConfig,
}

impl<S: SnapshotStore> Scheduler<S> {
    pub fn new(registry: Arc<HandlerRegistry>, store: Arc<S>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            snapshots: Arc::new(SnapshotManager::new(store)),
            bus: EventBus::new(),
            definitions: DashMap::new(),
            active: DashMap::new(),
            config,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to events for one run.
    pub fn watch(&self, run_id: Uuid) -> RunWatcher {
        self.bus.watch(run_id)
    }

    /// Register a definition for later resume.
    ///
    /// `create_run` registers implicitly; after a process restart the
    /// definition (and its handlers) must be re-registered before `resume`,
    /// since snapshots persist identifiers, not closures.
    pub fn register_definition(&self, definition: Arc<Definition>) {
        self.definitions.insert(definition.id, definition);
    }

    /// Create a run of a committed definition.
    ///
    /// Validates the input against the definition's declared shape and
    /// verifies every step and predicate the graph references is
    /// registered, so a started run can never stall on a missing callable.
    pub fn create_run(
        &self,
        definition: Arc<Definition>,
        input: Value,
    ) -> Result<Run, ExecutorError> {
        let got = ValueShape::of(&input);
        if !definition.input_shape.accepts(got) {
            return Err(ExecutorError::InputValidation {
                expected: definition.input_shape,
                got,
            });
        }
        self.check_references(&definition)?;
        self.definitions.insert(definition.id, definition.clone());

        Ok(Run {
            id: Uuid::now_v7(),
            definition,
            input,
            status: RunStatus::Pending,
        })
    }

    /// Execute a pending run to its first suspension or terminal status.
    #[instrument(skip_all, fields(run_id = %run.id, definition = %run.definition.name))]
    pub async fn start(&self, run: &Run) -> Result<ExecutionResult, ExecutorError> {
        if let Some(snapshot) = self.snapshots.try_load(run.id).await? {
            return Err(if snapshot.status.is_final() {
                ExecutorError::RunAlreadyFinished(run.id)
            } else {
                ExecutorError::RunAlreadyResuming(run.id)
            });
        }
        let cancel = self.claim(run.id)?;

        self.bus.publish(RunEvent::RunStarted {
            run_id: run.id,
            definition_name: run.definition.name.clone(),
        });
        info!("run started");

        let ctx = RunContext::new(run.id, run.input.clone());
        let result = self
            .drive(run.id, run.definition.clone(), ctx, None, cancel)
            .await;
        self.active.remove(&run.id);
        result
    }

    /// Resume a suspended run, delivering `payload` to the suspended step.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        payload: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let snapshot = self.snapshots.load(run_id).await?;
        if snapshot.status.is_final() {
            return Err(ExecutorError::RunAlreadyFinished(run_id));
        }
        if !snapshot.status.is_resumable() {
            return Err(ExecutorError::RunAlreadyFinished(run_id));
        }
        let definition = self
            .definitions
            .get(&snapshot.definition_id)
            .map(|entry| entry.value().clone())
            .ok_or(ExecutorError::DefinitionNotRegistered(snapshot.definition_id))?;

        let cancel = self.claim(run_id)?;

        self.bus.publish(RunEvent::RunResumed { run_id });
        info!("run resumed");

        let ctx = RunContext::from_snapshot(&snapshot);
        let resume = snapshot.suspension.map(|suspension| ResumeSlot {
            node_id: suspension.node_id,
            payload,
        });
        let result = self.drive(run_id, definition, ctx, resume, cancel).await;
        self.active.remove(&run_id);
        result
    }

    /// Cancel a run. An executing run is interrupted at its next step
    /// boundary; a suspended run transitions straight to `Failed`.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        if let Some(active) = self.active.get(&run_id) {
            active.cancel.cancel();
            info!(run_id = %run_id, "cancellation requested");
            return Ok(());
        }

        let snapshot = self.snapshots.load(run_id).await?;
        if snapshot.status.is_final() {
            return Err(ExecutorError::RunAlreadyFinished(run_id));
        }
        let mut cancelled = snapshot;
        cancelled.status = RunStatus::Failed;
        cancelled.error = Some("run cancelled".to_string());
        cancelled.suspension = None;
        cancelled.frontier.clear();
        cancelled.taken_at = Utc::now();
        self.snapshots.persist(&cancelled).await?;
        self.bus.publish(RunEvent::RunFailed {
            run_id,
            failed_step: None,
            error: "run cancelled".to_string(),
        });
        Ok(())
    }

    /// Current status of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunStatus, ExecutorError> {
        if self.active.contains_key(&run_id) {
            return Ok(RunStatus::Running);
        }
        Ok(self.snapshots.load(run_id).await?.status)
    }

    /// Latest persisted snapshot of a run.
    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunSnapshot, ExecutorError> {
        Ok(self.snapshots.load(run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn claim(&self, run_id: Uuid) -> Result<CancellationToken, ExecutorError> {
        match self.active.entry(run_id) {
            Entry::Occupied(_) => Err(ExecutorError::RunAlreadyResuming(run_id)),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(ActiveRun {
                    cancel: cancel.clone(),
                });
                Ok(cancel)
            }
        }
    }

    fn check_references(&self, definition: &Definition) -> Result<(), ExecutorError> {
        let mut missing = None;
        definition.root.visit(&mut |node| {
            if missing.is_some() {
                return;
            }
            match node {
                GraphNode::Step { step } | GraphNode::Map { step, .. } => {
                    if !self.registry.has_step(&step.id) {
                        missing = Some(ExecutorError::HandlerNotRegistered(
                            step.handler_key().to_string(),
                        ));
                    }
                }
                GraphNode::Branch { arms, .. } => {
                    for arm in arms {
                        if !self.registry.has_predicate(&arm.predicate) {
                            missing =
                                Some(ExecutorError::PredicateNotRegistered(arm.predicate.clone()));
                            return;
                        }
                    }
                }
                GraphNode::DoWhile { predicate, .. } | GraphNode::DoUntil { predicate, .. } => {
                    if !self.registry.has_predicate(predicate) {
                        missing = Some(ExecutorError::PredicateNotRegistered(predicate.clone()));
                    }
                }
                _ => {}
            }
        });
        match missing {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn drive(
        &self,
        run_id: Uuid,
        definition: Arc<Definition>,
        ctx: RunContext,
        resume: Option<ResumeSlot>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        let env = Arc::new(ExecEnv {
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            run_id,
            cancel,
            limiter: Arc::new(Semaphore::new(self.config.max_parallelism)),
            step_timeout: self.config.step_timeout,
            resume: Mutex::new(resume),
        });
        let base_ctx = ctx.clone();
        let input = ctx.input.clone();
        let started = Instant::now();

        let evaluated = timeout(
            self.config.run_timeout,
            eval_node(env, definition.root.clone(), input, ctx),
        )
        .await;

        match evaluated {
            Ok(Ok((NodeEval::Output(output), ctx))) => {
                let snapshot = build_snapshot(
                    run_id,
                    definition.id,
                    RunStatus::Completed,
                    &ctx,
                    SnapshotDetail {
                        output: Some(output.clone()),
                        ..Default::default()
                    },
                );
                self.snapshots.persist(&snapshot).await?;
                self.bus.publish(RunEvent::RunCompleted {
                    run_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                info!(run_id = %run_id, "run completed");
                Ok(ExecutionResult {
                    run_id,
                    status: RunStatus::Completed,
                    output: Some(output),
                    outputs: ctx.outputs().clone(),
                    error: None,
                    failed_step: None,
                })
            }
            Ok(Ok((NodeEval::Suspended { node_id, payload }, ctx))) => {
                let snapshot = build_snapshot(
                    run_id,
                    definition.id,
                    RunStatus::Suspended,
                    &ctx,
                    SnapshotDetail {
                        frontier: vec![node_id.clone()],
                        suspension: Some(Suspension {
                            node_id: node_id.clone(),
                            payload: payload.clone(),
                        }),
                        ..Default::default()
                    },
                );
                self.snapshots.persist(&snapshot).await?;
                self.bus.publish(RunEvent::RunSuspended {
                    run_id,
                    step_id: node_id,
                    payload,
                });
                info!(run_id = %run_id, "run suspended");
                Ok(ExecutionResult {
                    run_id,
                    status: RunStatus::Suspended,
                    output: None,
                    outputs: ctx.outputs().clone(),
                    error: None,
                    failed_step: None,
                })
            }
            Ok(Err(failure)) => {
                self.fail(run_id, definition.id, failure.ctx, failure.error)
                    .await
            }
            // The timed-out walk is dropped mid-flight, so only the context
            // from the start of the pass remains.
            Err(_) => {
                self.fail(run_id, definition.id, base_ctx, ExecutorError::RunTimeout)
                    .await
            }
        }
    }

    /// Persist a terminal `Failed` snapshot and fold the error into the
    /// result. Step-level failures are run outcomes, not API errors.
    async fn fail(
        &self,
        run_id: Uuid,
        definition_id: Uuid,
        ctx: RunContext,
        err: ExecutorError,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (failed_step, message) = failure_parts(&err);
        let snapshot = build_snapshot(
            run_id,
            definition_id,
            RunStatus::Failed,
            &ctx,
            SnapshotDetail {
                error: Some(message.clone()),
                failed_step: failed_step.clone(),
                ..Default::default()
            },
        );
        self.snapshots.persist(&snapshot).await?;
        self.bus.publish(RunEvent::RunFailed {
            run_id,
            failed_step: failed_step.clone(),
            error: message.clone(),
        });
        warn!(run_id = %run_id, error = %message, "run failed");
        Ok(ExecutionResult {
            run_id,
            status: RunStatus::Failed,
            output: None,
            outputs: ctx.outputs().clone(),
            error: Some(message),
            failed_step,
        })
    }
}

fn failure_parts(err: &ExecutorError) -> (Option<String>, String) {
    match err {
        ExecutorError::StepFailed { step_id, message } => (Some(step_id.clone()), message.clone()),
        ExecutorError::StepTimeout { step_id } => (Some(step_id.clone()), err.to_string()),
        other => (None, other.to_string()),
    }
}

#[derive(Default)]
struct SnapshotDetail {
    frontier: Vec<String>,
    suspension: Option<Suspension>,
    output: Option<Value>,
    error: Option<String>,
    failed_step: Option<String>,
}

fn build_snapshot(
    run_id: Uuid,
    definition_id: Uuid,
    status: RunStatus,
    ctx: &RunContext,
    detail: SnapshotDetail,
) -> RunSnapshot {
    RunSnapshot {
        run_id,
        definition_id,
        status,
        input: ctx.input.clone(),
        frontier: detail.frontier,
        step_outputs: ctx.outputs().clone(),
        completed: ctx.completed().clone(),
        loop_states: ctx.loop_states().clone(),
        suspension: detail.suspension,
        output: detail.output,
        error: detail.error,
        failed_step: detail.failed_step,
        taken_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Graph evaluation
// ---------------------------------------------------------------------------

struct ResumeSlot {
    node_id: String,
    payload: Value,
}

struct ExecEnv {
    registry: Arc<HandlerRegistry>,
    bus: EventBus,
    run_id: Uuid,
    cancel: CancellationToken,
    limiter: Arc<Semaphore>,
    step_timeout: Duration,
    /// Pending resume delivery; taken by the matching step, exactly once.
    resume: Mutex<Option<ResumeSlot>>,
}

enum NodeEval {
    Output(Value),
    Suspended { node_id: String, payload: Value },
}

/// Evaluation failure carrying the context as accumulated at the failure
/// point. Outputs recorded earlier in the pass stay grow-only: they survive
/// into the Failed snapshot and the returned result.
struct EvalFailure {
    error: ExecutorError,
    ctx: RunContext,
}

impl EvalFailure {
    fn new(error: ExecutorError, ctx: RunContext) -> Self {
        Self { error, ctx }
    }
}

type EvalResult = Result<(NodeEval, RunContext), EvalFailure>;

/// Evaluate one node. Boxed because the walk recurses through owned
/// subtrees spawned onto tasks.
fn eval_node(
    env: Arc<ExecEnv>,
    node: GraphNode,
    input: Value,
    mut ctx: RunContext,
) -> BoxFuture<'static, EvalResult> {
    Box::pin(async move {
        // Completed nodes replay their recorded output without executing.
        let node_id = node.id().to_string();
        if ctx.is_completed(&node_id) {
            let output = ctx.output_of(&node_id).cloned().unwrap_or(Value::Null);
            return Ok((NodeEval::Output(output), ctx));
        }

        match node {
            GraphNode::Step { step } => eval_step(env, step, input, ctx).await,

            GraphNode::Sequence { id, children } => {
                let mut current = input;
                for child in children {
                    let (eval, next_ctx) = eval_node(env.clone(), child, current, ctx).await?;
                    ctx = next_ctx;
                    match eval {
                        NodeEval::Output(value) => current = value,
                        suspended => return Ok((suspended, ctx)),
                    }
                }
                if let Err(err) = ctx.record_output(&id, current.clone()) {
                    return Err(EvalFailure::new(err.into(), ctx));
                }
                Ok((NodeEval::Output(current), ctx))
            }

            GraphNode::Parallel { id, children } => {
                let count = children.len();
                let mut set = JoinSet::new();
                for (idx, child) in children.into_iter().enumerate() {
                    let env = env.clone();
                    let input = input.clone();
                    let child_ctx = ctx.clone();
                    set.spawn(async move { (idx, eval_node(env, child, input, child_ctx).await) });
                }
                let (eval, ctx) = collect_fan_out(&id, count, set, ctx).await?;
                Ok((eval, ctx))
            }

            GraphNode::Branch { id, arms } => {
                for arm in arms {
                    let Some(predicate) = env.registry.predicate(&arm.predicate) else {
                        return Err(EvalFailure::new(
                            ExecutorError::PredicateNotRegistered(arm.predicate.clone()),
                            ctx,
                        ));
                    };
                    if predicate(&input) {
                        let (eval, next_ctx) =
                            eval_node(env.clone(), arm.node, input, ctx).await?;
                        ctx = next_ctx;
                        return match eval {
                            NodeEval::Output(value) => {
                                if let Err(err) = ctx.record_output(&id, value.clone()) {
                                    return Err(EvalFailure::new(err.into(), ctx));
                                }
                                Ok((NodeEval::Output(value), ctx))
                            }
                            suspended => Ok((suspended, ctx)),
                        };
                    }
                }
                // No arm matched: the input passes through unchanged.
                if let Err(err) = ctx.record_output(&id, input.clone()) {
                    return Err(EvalFailure::new(err.into(), ctx));
                }
                Ok((NodeEval::Output(input), ctx))
            }

            GraphNode::DoWhile {
                id,
                body,
                predicate,
                max_iterations,
            } => eval_loop(env, id, *body, predicate, max_iterations, false, input, ctx).await,

            GraphNode::DoUntil {
                id,
                body,
                predicate,
                max_iterations,
            } => eval_loop(env, id, *body, predicate, max_iterations, true, input, ctx).await,

            GraphNode::ForEach { id, items, body } => {
                let items = match items {
                    Some(list) => list,
                    None => match expect_array(&input) {
                        Ok(list) => list,
                        Err(error) => return Err(EvalFailure::new(error, ctx)),
                    },
                };
                eval_fan_out(env, id, *body, items, ctx).await
            }

            GraphNode::Map { id, step } => {
                let items = match expect_array(&input) {
                    Ok(list) => list,
                    Err(error) => return Err(EvalFailure::new(error, ctx)),
                };
                eval_fan_out(env, id, GraphNode::step(step), items, ctx).await
            }
        }
    })
}

fn expect_array(input: &Value) -> Result<Vec<Value>, ExecutorError> {
    input
        .as_array()
        .cloned()
        .ok_or_else(|| ExecutorError::InputValidation {
            expected: ValueShape::Array,
            got: ValueShape::of(input),
        })
}

async fn eval_step(
    env: Arc<ExecEnv>,
    step: StepSpec,
    input: Value,
    mut ctx: RunContext,
) -> EvalResult {
    let node_id = step.id.clone();
    let Some(handler) = env.registry.step(&node_id) else {
        return Err(EvalFailure::new(
            ExecutorError::HandlerNotRegistered(step.handler_key().to_string()),
            ctx,
        ));
    };

    // A resume targets exactly one step; the payload is delivered once.
    let resume_payload = {
        let mut slot = env.resume.lock().await;
        match slot.as_ref() {
            Some(pending) if pending.node_id == node_id => slot.take().map(|s| s.payload),
            _ => None,
        }
    };
    let input = match &resume_payload {
        Some(payload) => merge_resume(input, payload),
        None => input,
    };

    let _permit = match env.limiter.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(EvalFailure::new(ExecutorError::Cancelled, ctx)),
    };

    env.bus.publish(RunEvent::StepStarted {
        run_id: env.run_id,
        step_id: node_id.clone(),
    });
    let step_ctx = StepContext {
        run_id: env.run_id,
        step_id: node_id.clone(),
        outputs: Arc::new(ctx.outputs().clone()),
        resume_payload,
    };
    let started = Instant::now();

    let outcome = tokio::select! {
        _ = env.cancel.cancelled() => return Err(EvalFailure::new(ExecutorError::Cancelled, ctx)),
        result = timeout(env.step_timeout, handler.execute(input, step_ctx)) => result,
    };

    match outcome {
        Ok(Ok(StepOutcome::Output(value))) => {
            if let Err(err) = ctx.record_output(&node_id, value.clone()) {
                return Err(EvalFailure::new(err.into(), ctx));
            }
            env.bus.publish(RunEvent::StepCompleted {
                run_id: env.run_id,
                step_id: node_id,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            Ok((NodeEval::Output(value), ctx))
        }
        Ok(Ok(StepOutcome::Suspend(payload))) => {
            // Not marked completed: the resume pass re-invokes this step
            // with the resume payload.
            Ok((NodeEval::Suspended { node_id, payload }, ctx))
        }
        Ok(Err(err)) => {
            env.bus.publish(RunEvent::StepFailed {
                run_id: env.run_id,
                step_id: node_id.clone(),
                error: err.message.clone(),
            });
            Err(EvalFailure::new(
                ExecutorError::StepFailed {
                    step_id: node_id,
                    message: err.message,
                },
                ctx,
            ))
        }
        Err(_) => {
            env.bus.publish(RunEvent::StepFailed {
                run_id: env.run_id,
                step_id: node_id.clone(),
                error: format!("timed out after {:?}", env.step_timeout),
            });
            Err(EvalFailure::new(
                ExecutorError::StepTimeout { step_id: node_id },
                ctx,
            ))
        }
    }
}

/// Resume payloads shallow-merge over the step's resolved input when both
/// are objects; otherwise the payload replaces the input.
fn merge_resume(input: Value, payload: &Value) -> Value {
    match (input, payload) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (_, payload) => payload.clone(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn eval_loop(
    env: Arc<ExecEnv>,
    id: String,
    body: GraphNode,
    predicate: String,
    max_iterations: Option<u32>,
    until: bool,
    input: Value,
    mut ctx: RunContext,
) -> EvalResult {
    let Some(predicate_fn) = env.registry.predicate(&predicate) else {
        return Err(EvalFailure::new(
            ExecutorError::PredicateNotRegistered(predicate.clone()),
            ctx,
        ));
    };
    let body_ids = body.collect_ids();
    let cap = max_iterations.unwrap_or(DEFAULT_MAX_LOOP_ITERATIONS);

    let mut state = ctx.loop_state(&id);
    // A resumed loop continues its in-flight iteration: input is the last
    // completed iteration's output, and the body's completed-set already
    // reflects partial progress.
    let mut current = if state.iterations == 0 {
        input
    } else {
        state.last_output.clone().unwrap_or(Value::Null)
    };

    loop {
        let (eval, next_ctx) =
            eval_node(env.clone(), body.clone(), current, ctx).await?;
        ctx = next_ctx;

        let value = match eval {
            NodeEval::Output(value) => value,
            suspended => {
                ctx.set_loop_state(&id, state);
                return Ok((suspended, ctx));
            }
        };

        state.iterations += 1;
        state.last_output = Some(value.clone());
        ctx.set_loop_state(&id, state.clone());

        let holds = predicate_fn(&value);
        let continuing = if until { !holds } else { holds };
        if !continuing {
            if let Err(err) = ctx.record_output(&id, value.clone()) {
                return Err(EvalFailure::new(err.into(), ctx));
            }
            return Ok((NodeEval::Output(value), ctx));
        }
        if state.iterations >= cap {
            return Err(EvalFailure::new(
                ExecutorError::InfiniteLoopSuspected {
                    node_id: id,
                    iterations: state.iterations,
                },
                ctx,
            ));
        }

        ctx.begin_iteration(&body_ids);
        current = value;
    }
}

/// Fan a body out over items with `@<index>`-scoped ids, preserving item
/// order in the aggregated output. Shared by for-each and map.
async fn eval_fan_out(
    env: Arc<ExecEnv>,
    id: String,
    body: GraphNode,
    items: Vec<Value>,
    ctx: RunContext,
) -> EvalResult {
    let count = items.len();
    let mut set = JoinSet::new();
    for (idx, item) in items.into_iter().enumerate() {
        let scoped = body.with_scoped_ids(&idx.to_string());
        let env = env.clone();
        let child_ctx = ctx.clone();
        set.spawn(async move { (idx, eval_node(env, scoped, item, child_ctx).await) });
    }
    collect_fan_out(&id, count, set, ctx).await
}

/// Drain a fan-out join set. Child outputs land by index so declared order
/// survives completion order. The first error aborts remaining children;
/// suspensions let siblings finish, then the earliest-index suspension
/// propagates.
async fn collect_fan_out(
    id: &str,
    count: usize,
    mut set: JoinSet<(usize, EvalResult)>,
    mut ctx: RunContext,
) -> EvalResult {
    let mut outputs: Vec<Option<Value>> = vec![None; count];
    let mut suspension: Option<(usize, String, Value)> = None;

    while let Some(joined) = set.join_next().await {
        let (idx, result) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(EvalFailure::new(ExecutorError::Join(e.to_string()), ctx)),
        };
        match result {
            Ok((NodeEval::Output(value), child_ctx)) => {
                if let Err(err) = ctx.merge(child_ctx) {
                    return Err(EvalFailure::new(err.into(), ctx));
                }
                outputs[idx] = Some(value);
            }
            Ok((NodeEval::Suspended { node_id, payload }, child_ctx)) => {
                if let Err(err) = ctx.merge(child_ctx) {
                    return Err(EvalFailure::new(err.into(), ctx));
                }
                if suspension.as_ref().is_none_or(|(i, _, _)| idx < *i) {
                    suspension = Some((idx, node_id, payload));
                }
            }
            Err(failure) => {
                // Fold the failing child's pre-failure recordings in before
                // the set drops and aborts the remaining siblings.
                let _ = ctx.merge(failure.ctx);
                return Err(EvalFailure::new(failure.error, ctx));
            }
        }
    }

    if let Some((_, node_id, payload)) = suspension {
        return Ok((NodeEval::Suspended { node_id, payload }, ctx));
    }

    let aggregated = Value::Array(
        outputs
            .into_iter()
            .map(|slot| slot.unwrap_or(Value::Null))
            .collect(),
    );
    if let Err(err) = ctx.record_output(id, aggregated.clone()) {
        return Err(EvalFailure::new(err.into(), ctx));
    }
    Ok((NodeEval::Output(aggregated), ctx))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strand_types::error::StoreError;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MemStore {
        inner: AsyncMutex<HashMap<Uuid, RunSnapshot>>,
    }

    impl SnapshotStore for MemStore {
        async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
            self.inner
                .lock()
                .await
                .insert(snapshot.run_id, snapshot.clone());
            Ok(())
        }

        async fn load(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
            Ok(self.inner.lock().await.get(&run_id).cloned())
        }
    }

    fn scheduler(registry: HandlerRegistry) -> Scheduler<MemStore> {
        Scheduler::new(
            Arc::new(registry),
            Arc::new(MemStore::default()),
            ExecutorConfig::default(),
        )
    }

    #[tokio::test]
    async fn linear_run_completes() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("double", |input: Value, _| async move {
            Ok(StepOutcome::Output(json!(input.as_i64().unwrap_or(0) * 2)))
        });
        registry.register_step_fn("inc", |input: Value, _| async move {
            Ok(StepOutcome::Output(json!(input.as_i64().unwrap_or(0) + 1)))
        });
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("arith")
            .then(StepSpec::untyped("double"))
            .unwrap()
            .then(StepSpec::untyped("inc"))
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(20)).unwrap();
        let result = scheduler.start(&run).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!(41)));
        assert_eq!(result.outputs["double"], json!(40));
        assert_eq!(result.outputs["inc"], json!(41));
        assert_eq!(scheduler.status(run.id).await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_output_preserves_declared_order() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("slow", |_, _| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(StepOutcome::Output(json!("slow")))
        });
        registry.register_step_fn("fast", |_, _| async move {
            Ok(StepOutcome::Output(json!("fast")))
        });
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("fanout")
            .parallel(vec![
                GraphNode::step(StepSpec::untyped("slow")),
                GraphNode::step(StepSpec::untyped("fast")),
            ])
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(null)).unwrap();
        let result = scheduler.start(&run).await.unwrap();
        // Declared order, not completion order.
        assert_eq!(result.output, Some(json!(["slow", "fast"])));
    }

    #[tokio::test]
    async fn do_while_runs_body_three_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("count", move |input: Value, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutcome::Output(json!(input.as_i64().unwrap_or(0) + 1)))
            }
        });
        registry.register_predicate("below-three", |v| v.as_i64().unwrap_or(0) < 3);
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("looper")
            .do_while(
                GraphNode::step(StepSpec::untyped("count")),
                "below-three",
                Some(10),
            )
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(0)).unwrap();
        let result = scheduler.start(&run).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn iteration_cap_fails_run() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("spin", |input: Value, _| async move {
            Ok(StepOutcome::Output(input))
        });
        registry.register_predicate("always", |_| true);
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("runaway")
            .do_while(GraphNode::step(StepSpec::untyped("spin")), "always", Some(5))
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(1)).unwrap();
        let result = scheduler.start(&run).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("5 iterations"));
    }

    #[tokio::test]
    async fn branch_takes_first_true_arm() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("first", |_, _| async {
            Ok(StepOutcome::Output(json!("first")))
        });
        registry.register_step_fn("second", |_, _| async {
            Ok(StepOutcome::Output(json!("second")))
        });
        // Both predicates hold; declaration order must win.
        registry.register_predicate("yes-a", |_| true);
        registry.register_predicate("yes-b", |_| true);
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("brancher")
            .branch([
                ("yes-a", GraphNode::step(StepSpec::untyped("first"))),
                ("yes-b", GraphNode::step(StepSpec::untyped("second"))),
            ])
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!({})).unwrap();
        let result = scheduler.start(&run).await.unwrap();
        assert_eq!(result.output, Some(json!("first")));
        assert!(!result.outputs.contains_key("second"));
    }

    #[tokio::test]
    async fn branch_skips_false_arms() {
        let mut registry = HandlerRegistry::new();
        for id in ["a", "b", "c"] {
            let tag = json!(id);
            registry.register_step_fn(id, move |_, _| {
                let tag = tag.clone();
                async move { Ok(StepOutcome::Output(tag)) }
            });
        }
        registry.register_predicate("no", |_| false);
        registry.register_predicate("yes-1", |_| true);
        registry.register_predicate("yes-2", |_| true);
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("three-arms")
            .branch([
                ("no", GraphNode::step(StepSpec::untyped("a"))),
                ("yes-1", GraphNode::step(StepSpec::untyped("b"))),
                ("yes-2", GraphNode::step(StepSpec::untyped("c"))),
            ])
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(null)).unwrap();
        let result = scheduler.start(&run).await.unwrap();
        assert_eq!(result.output, Some(json!("b")));
        assert!(!result.outputs.contains_key("a"));
        assert!(!result.outputs.contains_key("c"));
    }

    #[tokio::test]
    async fn step_failure_fails_run_and_reports_step() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("ok", |input: Value, _| async move {
            Ok(StepOutcome::Output(input))
        });
        registry.register_step_fn("boom", |_, _| async {
            Err::<StepOutcome, _>(crate::step::StepError::new("exploded"))
        });
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("fails")
            .then(StepSpec::untyped("ok"))
            .unwrap()
            .then(StepSpec::untyped("boom"))
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!(1)).unwrap();
        let result = scheduler.start(&run).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failed_step, Some("boom".to_string()));
        assert_eq!(result.error, Some("exploded".to_string()));
        // Outputs recorded before the failing step survive into the result
        // and the terminal snapshot.
        assert_eq!(result.outputs["ok"], json!(1));
        let snapshot = scheduler.snapshot(run.id).await.unwrap();
        assert_eq!(snapshot.step_outputs["ok"], json!(1));
        assert!(snapshot.completed.contains("ok"));
        assert_eq!(scheduler.status(run.id).await.unwrap(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn suspend_then_resume_delivers_payload_once() {
        let gate_calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let fetch_calls = fetch_calls.clone();
            registry.register_step_fn("fetch", move |_, _| {
                let fetch_calls = fetch_calls.clone();
                async move {
                    fetch_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StepOutcome::Output(json!({"amount": 120})))
                }
            });
        }
        {
            let gate_calls = gate_calls.clone();
            registry.register_step_fn("approve", move |input: Value, ctx: StepContext| {
                let gate_calls = gate_calls.clone();
                async move {
                    gate_calls.fetch_add(1, Ordering::SeqCst);
                    match ctx.resume_payload {
                        None => Ok(StepOutcome::Suspend(json!({"needs": "approval"}))),
                        Some(_) => Ok(StepOutcome::Output(input)),
                    }
                }
            });
        }
        let scheduler = scheduler(registry);

        let definition = WorkflowBuilder::new("approval")
            .then(StepSpec::untyped("fetch"))
            .unwrap()
            .then(StepSpec::untyped("approve"))
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler.create_run(definition, json!({})).unwrap();
        let first = scheduler.start(&run).await.unwrap();
        assert_eq!(first.status, RunStatus::Suspended);

        let snapshot = scheduler.snapshot(run.id).await.unwrap();
        assert_eq!(snapshot.suspension.as_ref().unwrap().node_id, "approve");
        assert_eq!(snapshot.frontier, vec!["approve".to_string()]);

        let second = scheduler
            .resume(run.id, json!({"approved": true}))
            .await
            .unwrap();
        assert_eq!(second.status, RunStatus::Completed);
        // Resume payload merged over the resolved step input.
        assert_eq!(
            second.output,
            Some(json!({"amount": 120, "approved": true}))
        );
        // Completed steps are never re-invoked across the resume.
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resume_unknown_run_is_snapshot_not_found() {
        let scheduler = scheduler(HandlerRegistry::new());
        let err = scheduler.resume(Uuid::now_v7(), json!(null)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn resume_finished_run_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("noop", |input: Value, _| async move {
            Ok(StepOutcome::Output(input))
        });
        let scheduler = scheduler(registry);
        let definition = WorkflowBuilder::new("oneshot")
            .then(StepSpec::untyped("noop"))
            .unwrap()
            .commit()
            .unwrap();
        let run = scheduler.create_run(definition, json!(1)).unwrap();
        scheduler.start(&run).await.unwrap();

        let err = scheduler.resume(run.id, json!(null)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RunAlreadyFinished(_)));

        let err = scheduler.start(&run).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RunAlreadyFinished(_)));
    }

    #[tokio::test]
    async fn create_run_validates_input_shape() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("sum", |input: Value, _| async move {
            Ok(StepOutcome::Output(input))
        });
        let scheduler = scheduler(registry);
        let definition = WorkflowBuilder::new("typed")
            .input_shape(ValueShape::Array)
            .then(StepSpec::new("sum", ValueShape::Array, ValueShape::Any))
            .unwrap()
            .commit()
            .unwrap();

        let err = scheduler.create_run(definition, json!(7)).unwrap_err();
        assert!(matches!(err, ExecutorError::InputValidation { .. }));
    }

    #[tokio::test]
    async fn create_run_requires_registered_handlers() {
        let scheduler = scheduler(HandlerRegistry::new());
        let definition = WorkflowBuilder::new("dangling")
            .then(StepSpec::untyped("ghost"))
            .unwrap()
            .commit()
            .unwrap();
        let err = scheduler.create_run(definition, json!(null)).unwrap_err();
        assert!(matches!(err, ExecutorError::HandlerNotRegistered(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn cancel_suspended_run_fails_it() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("wait", |_, ctx: StepContext| async move {
            match ctx.resume_payload {
                None => Ok(StepOutcome::Suspend(json!(null))),
                Some(payload) => Ok(StepOutcome::Output(payload)),
            }
        });
        let scheduler = scheduler(registry);
        let definition = WorkflowBuilder::new("waiter")
            .then(StepSpec::untyped("wait"))
            .unwrap()
            .commit()
            .unwrap();
        let run = scheduler.create_run(definition, json!(null)).unwrap();
        let result = scheduler.start(&run).await.unwrap();
        assert_eq!(result.status, RunStatus::Suspended);

        scheduler.cancel(run.id).await.unwrap();
        assert_eq!(scheduler.status(run.id).await.unwrap(), RunStatus::Failed);

        let err = scheduler.cancel(run.id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RunAlreadyFinished(_)));
    }

    #[tokio::test]
    async fn map_applies_step_per_element_in_order() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("square", |input: Value, _| async move {
            let n = input.as_i64().unwrap_or(0);
            Ok(StepOutcome::Output(json!(n * n)))
        });
        let scheduler = scheduler(registry);
        let definition = WorkflowBuilder::new("mapper")
            .map(StepSpec::untyped("square"))
            .unwrap()
            .commit()
            .unwrap();

        let run = scheduler
            .create_run(definition, json!([1, 2, 3, 4]))
            .unwrap();
        let result = scheduler.start(&run).await.unwrap();
        assert_eq!(result.output, Some(json!([1, 4, 9, 16])));
    }

    #[tokio::test]
    async fn map_over_empty_array_yields_empty_array() {
        let mut registry = HandlerRegistry::new();
        registry.register_step_fn("square", |input: Value, _| async move {
            Ok(StepOutcome::Output(input))
        });
        let scheduler = scheduler(registry);
        let definition = WorkflowBuilder::new("mapper")
            .map(StepSpec::untyped("square"))
            .unwrap()
            .commit()
            .unwrap();
        let run = scheduler.create_run(definition, json!([])).unwrap();
        let result = scheduler.start(&run).await.unwrap();
        assert_eq!(result.output, Some(json!([])));
    }
}
