use mnemos_store::StoreError;
use mnemos_types::MonotonicId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeakerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid speaker name {0:?}: must be non-empty and not contain 'unknown' or 'speaker'")]
    InvalidName(String),
    #[error("Invalid unknown-speaker label {0:?}: expected 'Unknown Speaker <n>' or '<n>'")]
    InvalidLabel(String),
    #[error("No unknown speaker with label {0}")]
    UnknownLabel(MonotonicId),
    #[error("No known speaker named {0:?}")]
    NameNotFound(String),
    #[error("A known speaker named {0:?} already exists")]
    NameExists(String),
}

pub type SpeakerResult<T> = Result<T, SpeakerError>;
