//! Error type shared by every layer of the embedded store.

use mnemos_types::MonotonicId;
use thiserror::Error;

/// Errors that can arise from embedded store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Attribute encoding error: {0}")]
    Json(#[from] serde_json::Error),
    /// The on-disk state contradicts itself. Never repaired automatically
    /// beyond a single index rebuild.
    #[error("Store corruption: {0}")]
    Corruption(String),
    #[error("Record not found: {0}")]
    NotFound(MonotonicId),
    #[error("Embedding has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Invalid ledger scope {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidScope(String),
    #[error("In-process lock poisoned by a panicking thread")]
    Poisoned,
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
