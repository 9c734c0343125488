//! Engine core for Strand: graph building, scheduling, and durable state.
//!
//! This crate contains the "brain" of the workflow engine:
//! - `builder` -- fluent graph builder with an immutable commit pass
//! - `plan` -- traversal-plan lowering and structural validation
//! - `definition` -- definition YAML parse/serialize and file IO
//! - `registry` -- step handlers and named predicates, resolved by id
//! - `step` -- the step execute contract (output, suspend, error)
//! - `context` -- mutable run state with grow-only output tracking
//! - `snapshot` -- `SnapshotStore` port and checkpoint manager
//! - `watch` -- broadcast event bus and per-run watchers
//! - `executor` -- the scheduler: create/start/resume/cancel
//!
//! Storage is expressed as the `SnapshotStore` trait; implementations live
//! in `strand-infra`.

pub mod builder;
pub mod context;
pub mod definition;
pub mod executor;
pub mod plan;
pub mod registry;
pub mod snapshot;
pub mod step;
pub mod watch;

pub use builder::{BuildError, WorkflowBuilder};
pub use executor::{ExecutionResult, ExecutorConfig, ExecutorError, Run, Scheduler};
pub use registry::HandlerRegistry;
pub use snapshot::{SnapshotError, SnapshotManager, SnapshotStore};
pub use step::{StepContext, StepError, StepHandler, StepOutcome};
pub use watch::{EventBus, RunWatcher};
