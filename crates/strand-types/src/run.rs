//! Run lifecycle status.
//!
//! Per-run state machine:
//! `Pending -> Running -> {Suspended <-> Running} -> {Completed | Failed}`.
//! `Completed` and `Failed` are final; `Suspended` is terminal except that
//! it is resumable. Cancellation maps to `Failed` with a cancellation cause.

use serde::{Deserialize, Serialize};

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether the run can never execute again.
    pub fn is_final(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `resume` is a legal operation from this status.
    ///
    /// `Running` is included: a crash between the status transition and the
    /// snapshot write leaves the persisted status at `Running`, which must
    /// be treated as "suspended but unsaved" and remain resumable.
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Suspended | RunStatus::Running)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Running, RunStatus::Suspended)
            | (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed) => true,
            (RunStatus::Suspended, RunStatus::Running) => true,
            // Cancellation of a suspended run.
            (RunStatus::Suspended, RunStatus::Failed) => true,
            _ => false,
        }
    }
}
