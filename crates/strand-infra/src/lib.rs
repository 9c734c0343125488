//! Snapshot store backends for the Strand workflow engine.
//!
//! Two implementations of `strand_core::SnapshotStore`:
//! - `memory::MemorySnapshotStore` -- process-local, for tests and
//!   ephemeral embedding
//! - `sqlite::SqliteSnapshotStore` -- durable, WAL-mode SQLite with split
//!   reader/writer pools

pub mod memory;
pub mod sqlite;

pub use memory::MemorySnapshotStore;
pub use sqlite::{DatabasePool, SqliteSnapshotStore};
