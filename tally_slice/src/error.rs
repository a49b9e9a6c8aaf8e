//! Engine error type.
use tally_storage::{BucketError, StorageError};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SliceError>;

/// Rollup engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    /// Series or level definition unusable for the requested operation.
    /// Not retryable.
    #[error("configuration error: {0}")]
    Config(String),
    /// Caller passed a key, filter or value the series cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Bad level definition.
    #[error(transparent)]
    Bucket(#[from] BucketError),
    /// Series file could not be parsed.
    #[error("series config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Series file could not be read.
    #[error("series config: {0}")]
    Io(#[from] std::io::Error),
    /// Store failure, including unique violations and lock timeouts.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SliceError {
    /// Whether re-running the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SliceError::Storage(StorageError::UniqueViolation(_)) | SliceError::Storage(StorageError::Lock(_))
        )
    }
}
