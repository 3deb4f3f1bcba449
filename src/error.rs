//! Error types for the custody store.
//!
//! The storage engine surfaces four families of failure: uniqueness-constraint
//! violations, referential-integrity violations, not-found lookups and
//! validation errors. Everything else is an infrastructure error from ReDB or
//! serialization.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::model::TransactionStatus;

/// Store error type covering constraint violations and lookups.
#[derive(Error, Debug)]
pub enum StoreError {
    // Uniqueness-constraint violations
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    #[error("Keyshare already exists for user {user_id} on node {mpc_node_id}")]
    KeyshareExists { user_id: Uuid, mpc_node_id: u16 },

    #[error("Transaction signature already recorded: {0}")]
    DuplicateSignature(String),

    // Not-found / referential-integrity violations
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Keyshare not found for user {user_id} on node {mpc_node_id}")]
    KeyshareNotFound { user_id: Uuid, mpc_node_id: u16 },

    #[error("No balance row for user {user_id} and mint {token_mint}")]
    BalanceNotFound { user_id: Uuid, token_mint: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    // Validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid MPC node id {node}: must be between 1 and {max}")]
    InvalidNodeId { node: u16, max: u16 },

    #[error("Invalid threshold: t={threshold} must be >= 1 and <= n={total}")]
    InvalidThreshold { threshold: u16, total: u16 },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Insufficient balance: have {available}, need {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    // Credential hashing errors
    #[error("Password hashing error: {0}")]
    Password(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

// Conversion from common error types

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for StoreError {
    fn from(err: argon2::password_hash::Error) -> Self {
        match err {
            // Verification mismatch, not an infrastructure failure
            argon2::password_hash::Error::Password => Self::InvalidCredentials,
            other => Self::Password(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_mismatch_maps_to_invalid_credentials() {
        let err: StoreError = argon2::password_hash::Error::Password.into();
        assert!(matches!(err, StoreError::InvalidCredentials));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidThreshold {
            threshold: 4,
            total: 3,
        };
        assert_eq!(
            err.to_string(),
            "Invalid threshold: t=4 must be >= 1 and <= n=3"
        );

        let err = StoreError::InvalidStatusTransition {
            from: TransactionStatus::Confirmed,
            to: TransactionStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition: confirmed -> pending"
        );
    }
}
