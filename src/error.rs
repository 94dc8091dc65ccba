// ABOUTME: Error taxonomy surfaced by the sync engine to its callers
// ABOUTME: Wraps store and HTTP failures alongside engine-level rejections

use sync_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A manual trigger arrived while a run was active.
    #[error("a synchronization run is already in progress")]
    AlreadyInProgress,

    #[error("no conflict recorded for key {0}")]
    ConflictNotFound(String),

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("batch size {0} is outside 1..=1000")]
    InvalidBatchSize(usize),

    #[error("malformed change record: {0}")]
    MalformedRecord(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// True for errors caused by caller input rather than engine state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidResolution(_)
                | SyncError::InvalidBatchSize(_)
                | SyncError::MalformedRecord(_)
                | SyncError::Config(_)
        )
    }
}
