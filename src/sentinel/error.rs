use thiserror::Error;

use crate::bridge::BridgeError;
use crate::chain::ChainError;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ScannerError {
    /// The block exists but is not deep enough yet
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ScannerError::Chain(ChainError::InsufficientConfirmations { .. })
        )
    }

    /// The input itself cannot be decoded; retrying it gives the same answer
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ScannerError::Parse(_) | ScannerError::Chain(ChainError::Decode(_))
        )
    }
}
