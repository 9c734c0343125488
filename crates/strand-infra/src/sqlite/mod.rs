//! SQLite-backed persistence.

pub mod pool;
pub mod snapshot;

pub use pool::DatabasePool;
pub use snapshot::SqliteSnapshotStore;
