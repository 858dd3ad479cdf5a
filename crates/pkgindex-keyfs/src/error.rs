//! Error type for keyfs operations

use pkgindex_common::Serial;
use std::time::Duration;

/// Error type for keyfs operations
#[derive(Debug, thiserror::Error)]
pub enum KeyFsError {
    #[error("relpath not found: {0}")]
    KeyNotFound(String),
    #[error("no changelog entry for serial {0}")]
    SerialNotFound(Serial),
    #[error("keyfs consistency error: {0}")]
    Consistency(String),
    #[error("could not acquire write admission within {0:?}")]
    WriteAdmissionTimeout(Duration),
    #[error("backend schema error: {0}")]
    Schema(String),
    #[error("invalid blob path: {0}")]
    InvalidPath(String),
    #[error("out of order import: expected serial {expected}, got {got}")]
    ImportOutOfOrder { expected: Serial, got: Serial },
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for KeyFsError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl KeyFsError {
    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_) | Self::SerialNotFound(_))
    }
}

pub type KeyFsResult<T> = Result<T, KeyFsError>;
