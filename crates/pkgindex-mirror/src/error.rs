//! Error type for mirror operations

use pkgindex_common::ProjectNameError;
use pkgindex_keyfs::KeyFsError;

/// Error type for mirror operations
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream not found: {0}")]
    UpstreamNotFound(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(
        "serial mismatch on GET {url:?}, cache serial {cached} is newer than returned serial {returned:?}"
    )]
    SerialRegression {
        url: String,
        cached: u64,
        returned: Option<u64>,
    },
    #[error("offline mode: {0}")]
    Offline(String),
    #[error("invalid project name: {0}")]
    InvalidName(#[from] ProjectNameError),
    #[error(transparent)]
    KeyFs(#[from] KeyFsError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MirrorError {
    /// Errors that come from talking to (or not being able to talk to)
    /// the upstream index
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(
            self,
            Self::Upstream(_) | Self::SerialRegression { .. } | Self::Offline(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::UpstreamNotFound(_) => true,
            Self::KeyFs(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
