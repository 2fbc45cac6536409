//! Error taxonomy shared by the local store, the remote service and the
//! reconciliation repository.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network or service failure on a remote call, including timeouts.
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote service answered with a non-retryable error.
    #[error("remote service rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// A local write failed after the remote write had already succeeded.
    /// The remote document is orphaned until the next sync pulls it down.
    #[error("local write failed after remote write of {remote_id}: {source}")]
    LocalWriteFailed {
        remote_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn remote_unavailable(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable(message.into())
    }

    pub fn remote_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn local_write_failed(remote_id: &str, source: Error) -> Self {
        Self::LocalWriteFailed {
            remote_id: remote_id.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether a remote call that produced this error may be attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteUnavailable(_) => true,
            Self::RemoteRejected { status, .. } => matches!(status, 408 | 409 | 425 | 429),
            _ => false,
        }
    }

    /// True for failures that happened on the remote side of a write.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable(_) | Self::RemoteRejected { .. }
        )
    }

    /// Map SQLite constraint failures to [`Error::ConstraintViolation`].
    pub(crate) fn from_sqlite(err: rusqlite::Error, what: &str) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let detail = msg.clone().unwrap_or_else(|| code.to_string());
                Self::ConstraintViolation(format!("{what}: {detail}"))
            }
            other => Self::Storage(other),
        }
    }
}
