//! In-memory snapshot store.

use dashmap::DashMap;
use strand_core::SnapshotStore;
use strand_types::error::StoreError;
use strand_types::snapshot::RunSnapshot;
use uuid::Uuid;

/// Process-local store keyed by run id. Nothing survives a restart; meant
/// for tests and short-lived embedded schedulers.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<Uuid, RunSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        self.snapshots.insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self.snapshots.get(&run_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use strand_types::run::RunStatus;

    fn snapshot(run_id: Uuid, status: RunStatus) -> RunSnapshot {
        RunSnapshot {
            run_id,
            definition_id: Uuid::now_v7(),
            status,
            input: json!(null),
            frontier: vec![],
            step_outputs: Default::default(),
            completed: Default::default(),
            loop_states: Default::default(),
            suspension: None,
            output: None,
            error: None,
            failed_step: None,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = MemorySnapshotStore::new();
        let run_id = Uuid::now_v7();
        store
            .save(&snapshot(run_id, RunStatus::Suspended))
            .await
            .unwrap();
        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Suspended);
    }

    #[tokio::test]
    async fn save_overwrites() {
        let store = MemorySnapshotStore::new();
        let run_id = Uuid::now_v7();
        store
            .save(&snapshot(run_id, RunStatus::Running))
            .await
            .unwrap();
        store
            .save(&snapshot(run_id, RunStatus::Completed))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = MemorySnapshotStore::new();
        assert!(store.load(Uuid::now_v7()).await.unwrap().is_none());
    }
}
