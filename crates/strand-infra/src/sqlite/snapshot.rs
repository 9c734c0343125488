//! SQLite snapshot store.
//!
//! Snapshots are stored as JSON blobs, one row per run. Saves upsert on the
//! run id, so the table always holds the latest checkpoint and a replayed
//! save is a no-op rather than a conflict. Status and definition id are
//! denormalized into their own columns for querying without decoding blobs.

use sqlx::Row;
use strand_core::SnapshotStore;
use strand_types::error::StoreError;
use strand_types::snapshot::RunSnapshot;
use tracing::debug;
use uuid::Uuid;

use super::pool::DatabasePool;

/// Durable snapshot store on a split SQLite pool.
pub struct SqliteSnapshotStore {
    pool: DatabasePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        let blob = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Backend(format!("snapshot encode failed: {e}")))?;
        let status = serde_json::to_value(snapshot.status)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO run_snapshots (run_id, definition_id, status, snapshot, taken_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                definition_id = excluded.definition_id,
                status = excluded.status,
                snapshot = excluded.snapshot,
                taken_at = excluded.taken_at
            "#,
        )
        .bind(snapshot.run_id.to_string())
        .bind(snapshot.definition_id.to_string())
        .bind(status)
        .bind(blob)
        .bind(snapshot.taken_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(run_id = %snapshot.run_id, status = ?snapshot.status, "snapshot written");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM run_snapshots WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let blob: String = row
            .try_get("snapshot")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let snapshot: RunSnapshot = serde_json::from_str(&blob)
            .map_err(|e| StoreError::Corrupt(format!("run {run_id}: {e}")))?;
        Ok(Some(snapshot))
    }
}
