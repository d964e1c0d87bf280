//! Error types for ConsignChain

use std::fmt;

/// Coarse classification of a [`ChainError`], used to decide whether an error
/// is rejected, triggers a resync, or maps to a particular HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Ordering,
    NotFound,
    Transport,
    State,
    Storage,
}

#[derive(Debug, Clone)]
pub enum ChainError {
    InvalidInput(String),
    MissingField(String),
    InvalidTransactionType(String),
    InvalidTransaction(String),
    InvalidBlock(String),
    InvalidBlockchain(String),
    InvalidMessage(String),
    CryptoError(String),
    StaleBlock { index: u64, latest: u64 },
    BlockGap { index: u64, expected: u64 },
    BlockLinkage { expected: String, found: String },
    NotFound(String),
    NetworkError(String),
    InvalidState(String),
    DatabaseError(String),
    SerializationError(String),
    IoError(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::InvalidInput(_)
            | ChainError::MissingField(_)
            | ChainError::InvalidTransactionType(_)
            | ChainError::InvalidTransaction(_)
            | ChainError::InvalidBlock(_)
            | ChainError::InvalidBlockchain(_)
            | ChainError::InvalidMessage(_)
            | ChainError::CryptoError(_)
            | ChainError::SerializationError(_) => ErrorKind::Validation,
            ChainError::StaleBlock { .. }
            | ChainError::BlockGap { .. }
            | ChainError::BlockLinkage { .. } => ErrorKind::Ordering,
            ChainError::NotFound(_) => ErrorKind::NotFound,
            ChainError::NetworkError(_) => ErrorKind::Transport,
            ChainError::InvalidState(_) => ErrorKind::State,
            ChainError::DatabaseError(_) | ChainError::IoError(_) => ErrorKind::Storage,
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ChainError::MissingField(field) => write!(f, "Missing field: {}", field),
            ChainError::InvalidTransactionType(t) => {
                write!(f, "Invalid transaction type: '{}'", t)
            }
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InvalidBlockchain(msg) => write!(f, "Invalid blockchain: {}", msg),
            ChainError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::StaleBlock { index, latest } => write!(
                f,
                "Block index {} is less than or equal to latest block index {}",
                index, latest
            ),
            ChainError::BlockGap { index, expected } => write!(
                f,
                "Block index {} is greater than next expected index {}",
                index, expected
            ),
            ChainError::BlockLinkage { expected, found } => write!(
                f,
                "Invalid block linkage: expected previous hash {}, got {}",
                expected, found
            ),
            ChainError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::NetworkError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_errors_are_classified() {
        let gap = ChainError::BlockGap { index: 5, expected: 2 };
        assert_eq!(gap.kind(), ErrorKind::Ordering);
        assert_eq!(
            gap.to_string(),
            "Block index 5 is greater than next expected index 2"
        );

        let stale = ChainError::StaleBlock { index: 1, latest: 3 };
        assert_eq!(stale.kind(), ErrorKind::Ordering);
    }

    #[test]
    fn test_validation_and_lookup_kinds() {
        assert_eq!(
            ChainError::InvalidTransaction("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ChainError::NotFound("c1".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            ChainError::InvalidState("bogus".into()).kind(),
            ErrorKind::State
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ChainError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, ChainError::SerializationError(_)));
    }
}
