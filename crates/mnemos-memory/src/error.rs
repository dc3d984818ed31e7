use mnemos_store::StoreError;
use mnemos_types::CapabilityError;
use thiserror::Error;

/// Errors raised by the conversation memory manager.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Capability failure: {0}")]
    Capability(#[from] CapabilityError),
    /// The system message alone does not fit the requested budget.
    #[error("Budget of {budget} tokens cannot hold the {preamble}-token system message")]
    BudgetTooSmall { budget: usize, preamble: usize },
    /// Assembled context came out larger than its budget. Never truncated.
    #[error("Assembled context uses {used} tokens, budget is {budget}")]
    BudgetOverflow { budget: usize, used: usize },
    #[error("A batch needs at least one turn")]
    EmptyBatch,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl MemoryError {
    /// Malformed stored record, surfaced as store corruption.
    pub(crate) fn malformed(what: impl std::fmt::Display) -> Self {
        MemoryError::Store(StoreError::Corruption(what.to_string()))
    }
}
