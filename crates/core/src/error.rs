//! Error type shared by every core module.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Owner id is empty, too long, or contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid owner id: {0}")]
    InvalidOwnerId(String),

    /// A computed store path would leave its base directory.
    #[error("path escapes base directory: {0}")]
    PathEscape(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("record '{record_id}' already exists for owner '{owner_id}'")]
    DuplicateRecord { owner_id: String, record_id: String },

    /// The store was closed or never opened.
    #[error("store not initialized: {0}")]
    NotInitialized(String),

    #[error("invalid partition path: {0}")]
    InvalidPartition(String),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(String),

    #[error("object already exists: {0}")]
    ObjectExists(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("cannot summarize record: {0}")]
    Summarize(String),

    #[error("a migration run is already in progress")]
    MigrationInProgress,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
