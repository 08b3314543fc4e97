use rusqlite::ErrorCode;
use thiserror::Error;

/// Result alias for ledger storage operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error type surfaced by ledger storage operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("invalid ledger state: {0}")]
    InvalidState(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(value.to_string())
            }
            _ => Self::Storage(value.to_string()),
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
