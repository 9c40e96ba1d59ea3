//! Rechunk errors.

use rayon::ThreadPoolBuildError;
use thiserror::Error;
use zarrs::array::{ArrayCreateError, ArrayError};
use zarrs::storage::StorageError;

/// A rechunk error.
#[derive(Debug, Error)]
pub enum RechunkError {
    /// No array (or image group) exists at the path.
    #[error("no array or group metadata found at {0}")]
    NotFound(String),
    /// Metadata exists but is unreadable, inconsistent, or unsupported.
    #[error("invalid metadata: {0}")]
    Schema(String),
    /// The target chunk shape does not have one extent per array dimension.
    #[error("target chunk shape has {chunks} dimensions but the array has {array}")]
    ShapeMismatch {
        /// The array dimensionality.
        array: usize,
        /// The target chunk shape dimensionality.
        chunks: usize,
    },
    /// An underlying storage read, write, erase, or rename failed.
    #[error(transparent)]
    Io(#[from] StorageError),
    /// Chunks could not be assembled or encoded.
    #[error(transparent)]
    Array(ArrayError),
    /// The configuration could not be read, parsed, or validated.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The materialization thread pool could not be created.
    #[error(transparent)]
    ThreadPool(#[from] ThreadPoolBuildError),
}

impl From<std::io::Error> for RechunkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(StorageError::from(err))
    }
}

impl From<ArrayError> for RechunkError {
    fn from(err: ArrayError) -> Self {
        match err {
            ArrayError::StorageError(err) => Self::Io(err),
            err => Self::Array(err),
        }
    }
}

impl RechunkError {
    /// Classify an error from opening the array at `path`.
    pub(crate) fn from_array_create(path: &str, err: ArrayCreateError) -> Self {
        match err {
            ArrayCreateError::MissingMetadata => Self::NotFound(path.to_string()),
            ArrayCreateError::StorageError(StorageError::InvalidMetadata(key, reason)) => {
                Self::Schema(format!("{key}: {reason}"))
            }
            ArrayCreateError::StorageError(err) => Self::Io(err),
            err => Self::Schema(format!("{path}: {err}")),
        }
    }
}
