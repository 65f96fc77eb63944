//! Bridge error types

use thiserror::Error;

use crate::chain::ChainError;

/// PostgreSQL unique_violation
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The unique key already exists; a previous attempt succeeded
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Duplicate(_) => "DUPLICATE",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            BridgeError::InvalidRecord(_) => "INVALID_RECORD",
            BridgeError::Chain(e) => e.kind(),
            BridgeError::Database(_) => "DATABASE_ERROR",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    #[inline]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, BridgeError::Duplicate(_))
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                BridgeError::Duplicate(db.message().to_string())
            }
            sqlx::Error::RowNotFound => BridgeError::NotFound(e.to_string()),
            _ => BridgeError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::InvalidRecord(e.to_string())
    }
}
