use thiserror::Error;

/// Classified failure of a remote chain or service call.
///
/// Clients translate remote error messages and codes into a kind exactly once,
/// at the boundary. Orchestrators match on the kind and never on message text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Remote error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Block {height} has {confirmations} confirmations, need {required}")]
    InsufficientConfirmations {
        height: u64,
        confirmations: i64,
        required: u32,
    },

    #[error("Transaction hash already processed")]
    TxHashExists,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Gas required exceeds allowance")]
    GasInsufficient,

    #[error("Transaction already known")]
    AlreadyKnown,

    /// The sender's nonce has moved past this transaction's nonce
    #[error("Nonce too low")]
    NonceTooLow,

    #[error("Ledger entry already exists")]
    IndexExists,

    #[error("Ledger entry does not exist")]
    IndexNotExists,

    #[error("Ledger entry has an invalid status")]
    InvalidStatus,

    #[error("Caller is not authorized")]
    NotAuthorized,

    #[error("Custody request not found")]
    RequestNotFound,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Stable kind label, persisted as `last_error` on saga records
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::Transport(_) => "TRANSPORT",
            ChainError::Rpc { .. } => "RPC",
            ChainError::NotFound(_) => "NOT_FOUND",
            ChainError::InsufficientConfirmations { .. } => "INSUFFICIENT_CONFIRMATIONS",
            ChainError::TxHashExists => "TX_HASH_EXISTS",
            ChainError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ChainError::GasInsufficient => "GAS_INSUFFICIENT",
            ChainError::AlreadyKnown => "ALREADY_KNOWN",
            ChainError::NonceTooLow => "NONCE_TOO_LOW",
            ChainError::IndexExists => "INDEX_EXISTS",
            ChainError::IndexNotExists => "INDEX_NOT_EXISTS",
            ChainError::InvalidStatus => "INVALID_STATUS",
            ChainError::NotAuthorized => "NOT_AUTHORIZED",
            ChainError::RequestNotFound => "REQUEST_NOT_FOUND",
            ChainError::Rejected(_) => "REJECTED",
            ChainError::Timeout(_) => "TIMEOUT",
            ChainError::Decode(_) => "DECODE",
        }
    }

    /// Errors that only postpone the operation to the next poll
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_)
                | ChainError::Rpc { .. }
                | ChainError::Timeout(_)
                | ChainError::InsufficientConfirmations { .. }
        )
    }

    /// Mint failures that are answered with a direct transfer
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            ChainError::InsufficientBalance | ChainError::GasInsufficient
        )
    }

    /// Classify a JSON-RPC error returned by the rollup node.
    ///
    /// The bridge contract reverts with `non-repeatable processing` when a
    /// source tx hash was already minted.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("non-repeatable processing") {
            ChainError::TxHashExists
        } else if lower.contains("insufficient balance") || lower.contains("insufficient funds") {
            ChainError::InsufficientBalance
        } else if lower.contains("gas required exceeds allowanc") {
            ChainError::GasInsufficient
        } else if lower.contains("already known") {
            ChainError::AlreadyKnown
        } else if lower.contains("nonce too low") {
            ChainError::NonceTooLow
        } else {
            ChainError::Rpc {
                code,
                message: message.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout(e.to_string())
        } else if e.is_decode() {
            ChainError::Decode(e.to_string())
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

impl From<bitcoincore_rpc::Error> for ChainError {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        use bitcoincore_rpc::jsonrpc;

        match e {
            // RPC_INVALID_ADDRESS_OR_KEY: unknown block or transaction
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(ref rpc)) if rpc.code == -5 => {
                ChainError::NotFound(rpc.message.clone())
            }
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc)) => ChainError::Rpc {
                code: rpc.code as i64,
                message: rpc.message,
            },
            other => ChainError::Transport(other.to_string()),
        }
    }
}
