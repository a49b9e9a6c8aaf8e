//! Settlement error type.
use tally_slice::SliceError;

/// Result type alias for settlement operations.
pub type Result<T> = std::result::Result<T, SettleError>;

/// Settlement errors.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    /// Payout or aggregate amount was zero or negative.
    #[error("{what} amount must be positive, got {amount}")]
    NonPositiveAmount {
        /// Record kind.
        what: &'static str,
        /// Rejected amount.
        amount: f64,
    },
    /// Referenced record does not exist.
    #[error("unknown {what} {id}")]
    NotFound {
        /// Record kind.
        what: &'static str,
        /// Record id or hash.
        id: String,
    },
    /// Record with the same id or hash already exists.
    #[error("{what} {id} already exists")]
    Duplicate {
        /// Record kind.
        what: &'static str,
        /// Record id or hash.
        id: String,
    },
    /// Block was mined with an algorithm missing from the table.
    #[error("no hashes-per-share entry for algorithm {0}")]
    UnknownAlgo(String),
    /// Share data could not be read.
    #[error(transparent)]
    Slice(#[from] SliceError),
}

impl SettleError {
    pub(crate) fn not_found(what: &'static str, id: impl ToString) -> Self {
        SettleError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}
