//! Snapshot persistence port and manager.
//!
//! `SnapshotStore` is the storage seam: the engine depends on this trait
//! only, and backends (in-memory, SQLite) live in `strand-infra`. Saves are
//! idempotent overwrites keyed by run id: the store holds exactly one
//! snapshot per run, always the latest.
//!
//! `SnapshotManager` wraps a store with logging and the not-found
//! translation the scheduler wants.

use std::sync::Arc;

use strand_types::error::StoreError;
use strand_types::snapshot::RunSnapshot;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Durable storage for run snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, replacing any previous snapshot for the run.
    fn save(&self, snapshot: &RunSnapshot)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load the latest snapshot for a run, if one exists.
    fn load(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<RunSnapshot>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no snapshot found for run {0}")]
    NotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Checkpointing façade over a snapshot store.
pub struct SnapshotManager<S: SnapshotStore> {
    store: Arc<S>,
}

impl<S: SnapshotStore> SnapshotManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist the latest state of a run.
    pub async fn persist(&self, snapshot: &RunSnapshot) -> Result<(), SnapshotError> {
        self.store.save(snapshot).await?;
        debug!(
            run_id = %snapshot.run_id,
            status = ?snapshot.status,
            completed = snapshot.completed.len(),
            "snapshot persisted"
        );
        Ok(())
    }

    /// Load a run's snapshot, failing if the run is unknown.
    pub async fn load(&self, run_id: Uuid) -> Result<RunSnapshot, SnapshotError> {
        self.store
            .load(run_id)
            .await?
            .ok_or(SnapshotError::NotFound(run_id))
    }

    /// Load a run's snapshot, `None` if the run is unknown.
    pub async fn try_load(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, SnapshotError> {
        Ok(self.store.load(run_id).await?)
    }
}
