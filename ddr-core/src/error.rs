use crate::id::TxId;
use crate::identity::PartyKey;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with ledger storage
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors related to missing or invalid data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data that violates a ledger invariant
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

// Additional From conversions for common error types

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("Row not found".to_string()),
            _ => StorageError::Database(err.to_string()),
        }
    }
}

/// Signature checks on a [`crate::transaction::SignedTransaction`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid signature by {0}")]
    Invalid(PartyKey),

    #[error("Missing signatures from {}", format_keys(.0))]
    Missing(Vec<PartyKey>),

    #[error("Transaction id mismatch: claimed {claimed}, computed {actual}")]
    IdMismatch { claimed: TxId, actual: TxId },

    #[error("Encoding error: {0}")]
    Encoding(String),
}

fn format_keys(keys: &[PartyKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_backend_errors_keep_their_category() {
        let truncated = bincode::deserialize::<u64>(&[1, 2]).unwrap_err();
        let err = StorageError::from(truncated);
        assert!(matches!(err, StorageError::Serialization(_)));

        let err: StorageError = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("Failed to store state")
            .unwrap_err()
            .into();
        assert!(matches!(err, StorageError::Context(_)));
        assert_eq!(err.to_string(), "Failed to store state");
    }
}
