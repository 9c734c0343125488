//! Mutable run state threaded through graph evaluation.
//!
//! The context is grow-only: node outputs and completion marks are added,
//! never removed, with one exception: loop nodes clear their body's marks
//! between iterations so the body re-executes. Parallel children each get a
//! clone and the parent merges them back, so sibling writes never race.
//!
//! Oversized step outputs are truncated to a marker object and the whole
//! context is capped, so a chatty step cannot grow snapshots without bound.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use strand_types::snapshot::{LoopState, RunSnapshot};
use thiserror::Error;
use uuid::Uuid;

/// A single recorded output larger than this is replaced by a marker.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Hard cap on the serialized size of all recorded outputs combined.
const MAX_CONTEXT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("run context exceeded {MAX_CONTEXT_BYTES} bytes of recorded output")]
    Overflow,
}

/// Accumulated state of a run in flight.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    /// The original run input, immutable for the life of the run.
    pub input: Value,
    step_outputs: HashMap<String, Value>,
    completed: HashSet<String>,
    loop_states: HashMap<String, LoopState>,
    bytes: usize,
}

impl RunContext {
    pub fn new(run_id: Uuid, input: Value) -> Self {
        Self {
            run_id,
            input,
            step_outputs: HashMap::new(),
            completed: HashSet::new(),
            loop_states: HashMap::new(),
            bytes: 0,
        }
    }

    /// Rebuild a context from a persisted snapshot for resume.
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let bytes = snapshot
            .step_outputs
            .values()
            .map(estimated_size)
            .sum();
        Self {
            run_id: snapshot.run_id,
            input: snapshot.input.clone(),
            step_outputs: snapshot.step_outputs.clone(),
            completed: snapshot.completed.clone(),
            loop_states: snapshot.loop_states.clone(),
            bytes,
        }
    }

    // -----------------------------------------------------------------------
    // Outputs and completion
    // -----------------------------------------------------------------------

    /// Record a node's output and mark it completed.
    ///
    /// Outputs above the per-node limit are replaced with a truncation
    /// marker; the original value is dropped.
    pub fn record_output(&mut self, node_id: &str, output: Value) -> Result<(), ContextError> {
        let size = estimated_size(&output);
        let stored = if size > MAX_OUTPUT_BYTES {
            json!({
                "truncated": true,
                "original_bytes": size,
            })
        } else {
            output
        };
        let stored_size = estimated_size(&stored);

        if let Some(previous) = self.step_outputs.get(node_id) {
            self.bytes = self.bytes.saturating_sub(estimated_size(previous));
        }
        if self.bytes + stored_size > MAX_CONTEXT_BYTES {
            return Err(ContextError::Overflow);
        }
        self.bytes += stored_size;
        self.step_outputs.insert(node_id.to_string(), stored);
        self.completed.insert(node_id.to_string());
        Ok(())
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed.contains(node_id)
    }

    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.step_outputs.get(node_id)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }

    pub fn completed(&self) -> &HashSet<String> {
        &self.completed
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    pub fn loop_state(&self, node_id: &str) -> LoopState {
        self.loop_states.get(node_id).cloned().unwrap_or_default()
    }

    pub fn set_loop_state(&mut self, node_id: &str, state: LoopState) {
        self.loop_states.insert(node_id.to_string(), state);
    }

    pub fn loop_states(&self) -> &HashMap<String, LoopState> {
        &self.loop_states
    }

    /// Clear completion marks for a loop body so the next iteration
    /// re-executes it. Recorded outputs stay; they are overwritten as the
    /// iteration progresses.
    pub fn begin_iteration(&mut self, body_ids: &[String]) {
        for id in body_ids {
            self.completed.remove(id);
        }
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Fold a parallel child's context back into the parent.
    pub fn merge(&mut self, child: RunContext) -> Result<(), ContextError> {
        for (id, output) in child.step_outputs {
            if self.step_outputs.get(&id) != Some(&output) {
                let size = estimated_size(&output);
                if let Some(previous) = self.step_outputs.get(&id) {
                    self.bytes = self.bytes.saturating_sub(estimated_size(previous));
                }
                if self.bytes + size > MAX_CONTEXT_BYTES {
                    return Err(ContextError::Overflow);
                }
                self.bytes += size;
                self.step_outputs.insert(id, output);
            }
        }
        self.completed.extend(child.completed);
        self.loop_states.extend(child.loop_states);
        Ok(())
    }
}

fn estimated_size(value: &Value) -> usize {
    // String length of the compact encoding. Serializing a Value cannot
    // fail, so an encoding error degrades to "no size".
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
