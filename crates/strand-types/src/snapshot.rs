//! Durable run snapshots.
//!
//! A `RunSnapshot` is the serializable projection of a run sufficient to
//! continue execution without replaying completed steps: recorded node
//! outputs, the completed-node set, loop/iteration counters, and the
//! pending suspension if any. The scheduler persists one at every
//! suspension point and on terminal transitions; stores must support
//! idempotent overwrite keyed by run id.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::run::RunStatus;

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

/// Progress of an active loop node (do-while, do-until, for-each, map).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// Completed iterations (do-while/do-until) or completed items
    /// (for-each/map).
    pub iterations: u32,
    /// Output of the last completed iteration; the next iteration's input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// A pending suspension: which step asked to suspend and the payload it
/// handed to `suspend(payload)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    /// Id of the suspended step node (iteration-scoped inside for-each).
    pub node_id: String,
    /// Opaque payload supplied by the step, surfaced to watchers.
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// RunSnapshot
// ---------------------------------------------------------------------------

/// Serializable checkpoint of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Run identity, stable across suspend/resume cycles.
    pub run_id: Uuid,
    /// Definition this run executes.
    pub definition_id: Uuid,
    /// Status at the time the snapshot was taken.
    pub status: RunStatus,
    /// The original run input.
    pub input: Value,
    /// Node ids active or next-eligible when the snapshot was taken.
    #[serde(default)]
    pub frontier: Vec<String>,
    /// Recorded node outputs keyed by node id. Grow-only.
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
    /// Node ids that completed and are never re-executed.
    #[serde(default)]
    pub completed: HashSet<String>,
    /// Per-loop-node iteration progress.
    #[serde(default)]
    pub loop_states: HashMap<String, LoopState>,
    /// Pending suspension, present while status is `Suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    /// Final output, present once status is `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure detail, present once status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the failing step, when the failure originated in a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}
