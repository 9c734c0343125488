//! Errors surfaced by storage collaborators.

use thiserror::Error;

/// Errors from a snapshot store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A persisted snapshot could not be decoded.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}
