//! Shared domain types for the Strand workflow engine.
//!
//! Defines the canonical representation of workflow graphs (`GraphNode`,
//! `Definition`), execution state (`RunStatus`, `RunSnapshot`) and progress
//! events (`RunEvent`). Everything here is pure data: serde-serializable,
//! no IO, no async. The engine crate (`strand-core`) consumes these types;
//! the infrastructure crate (`strand-infra`) persists them.

pub mod definition;
pub mod error;
pub mod event;
pub mod graph;
pub mod run;
pub mod shape;
pub mod snapshot;
