//! Run progress events.
//!
//! Emitted by the scheduler in the wall-clock order of run/step state
//! transitions and fanned out over a broadcast channel. Watchers attaching
//! mid-run receive only subsequent events; current state is available via a
//! snapshot read instead of replay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A progress event for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run transitioned `Pending -> Running`.
    RunStarted {
        run_id: Uuid,
        definition_name: String,
    },
    /// A step's execute function was dispatched.
    StepStarted { run_id: Uuid, step_id: String },
    /// A step completed and its output was recorded.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    /// A step's execute function returned an error or timed out.
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    /// A step requested suspension; the snapshot has been persisted.
    RunSuspended {
        run_id: Uuid,
        step_id: String,
        payload: Value,
    },
    /// The run transitioned `Suspended -> Running`.
    RunResumed { run_id: Uuid },
    /// The frontier drained with no failures.
    RunCompleted { run_id: Uuid, duration_ms: u64 },
    /// An unrecoverable error propagated past all boundaries.
    RunFailed {
        run_id: Uuid,
        failed_step: Option<String>,
        error: String,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::RunSuspended { run_id, .. }
            | RunEvent::RunResumed { run_id }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serde_tagging() {
        let event = RunEvent::StepCompleted {
            run_id: Uuid::now_v7(),
            step_id: "fetch".to_string(),
            duration_ms: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_completed\""));
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, RunEvent::StepCompleted { .. }));
    }

    #[test]
    fn run_id_accessor_covers_all_variants() {
        let id = Uuid::now_v7();
        let events = vec![
            RunEvent::RunStarted {
                run_id: id,
                definition_name: "x".to_string(),
            },
            RunEvent::StepStarted {
                run_id: id,
                step_id: "a".to_string(),
            },
            RunEvent::RunSuspended {
                run_id: id,
                step_id: "a".to_string(),
                payload: json!(null),
            },
            RunEvent::RunResumed { run_id: id },
            RunEvent::RunCompleted {
                run_id: id,
                duration_ms: 1,
            },
            RunEvent::RunFailed {
                run_id: id,
                failed_step: None,
                error: "boom".to_string(),
            },
        ];
        for event in events {
            assert_eq!(event.run_id(), id);
        }
    }
}
