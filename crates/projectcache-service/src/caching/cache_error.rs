use thiserror::Error;

use crate::source::StoreError;

/// An error that happens while producing a project snapshot.
///
/// A project that does not exist is not an error, loads signal it with `Ok(None)` instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A read from the backing store failed.
    ///
    /// The previously cached state, if any, is left untouched so a later read can retry.
    #[error("failed to load project data: {0}")]
    Load(#[from] StoreError),
    /// A document was read successfully, but could not be decoded.
    #[error("malformed document at {path}: {details}")]
    Malformed { path: String, details: String },
    /// An unexpected error in the cache itself, such as a reload task that went away without
    /// producing a result.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    pub fn malformed(path: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::Malformed {
            path: path.into(),
            details: err.to_string(),
        }
    }

    /// Whether retrying the same read later may succeed.
    ///
    /// Request handlers use this to tell "temporarily unable to refresh" apart from a terminal
    /// failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Load(_) | CacheError::InternalError => true,
            CacheError::Malformed { .. } => false,
        }
    }

    /// A short name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::Load(StoreError::Unavailable(_)) => "unavailable",
            CacheError::Load(StoreError::PermissionDenied(_)) => "permission-denied",
            CacheError::Load(StoreError::Timeout(_)) => "timeout",
            CacheError::Malformed { .. } => "malformed",
            CacheError::InternalError => "internal",
        }
    }
}

/// The result of loading a project: `Ok(None)` if the project does not exist.
pub type LoadResult<T> = Result<Option<T>, CacheError>;
