use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A row holds a value the model cannot represent (unknown status, bad timestamp).
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store connection lock poisoned")]
    Poisoned,

    /// Raised by non-durable backends when the backing service cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
