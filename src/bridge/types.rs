//! Bridge records and events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::state::{DepositState, FallbackStatus, SettlementStatus, WithdrawStatus};

/// A scanned chain, one cursor row each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainKind {
    Bitcoin,
    Rollup,
    SettlementLedger,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Bitcoin => "bitcoin",
            ChainKind::Rollup => "rollup",
            ChainKind::SettlementLedger => "settlement",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scan watermark: everything at or before this position is durably recorded.
///
/// Positions order as `(height, tx_index, log_index)` tuples. A height that is
/// fully processed is stored with both indexes at `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexCursor {
    pub chain: ChainKind,
    pub height: u64,
    pub tx_index: u32,
    pub log_index: u32,
}

impl IndexCursor {
    pub const DONE: u32 = u32::MAX;

    /// Height fully processed
    pub fn block_done(chain: ChainKind, height: u64) -> Self {
        Self {
            chain,
            height,
            tx_index: Self::DONE,
            log_index: Self::DONE,
        }
    }

    /// Transactions up to and including `tx_index` processed
    pub fn after_tx(chain: ChainKind, height: u64, tx_index: u32) -> Self {
        Self {
            chain,
            height,
            tx_index,
            log_index: 0,
        }
    }

    pub fn at_log(chain: ChainKind, height: u64, tx_index: u32, log_index: u32) -> Self {
        Self {
            chain,
            height,
            tx_index,
            log_index,
        }
    }

    #[inline]
    pub fn is_block_done(&self) -> bool {
        self.tx_index == Self::DONE
    }

    /// First `(height, tx_index)` not covered by this cursor
    pub fn next_position(&self) -> (u64, u32) {
        if self.is_block_done() {
            (self.height + 1, 0)
        } else {
            (self.height, self.tx_index + 1)
        }
    }

    /// Whether a log position is already covered
    pub fn covers_log(&self, height: u64, tx_index: u32, log_index: u32) -> bool {
        (height, tx_index, log_index) <= self.key()
    }

    pub fn key(&self) -> (u64, u32, u32) {
        (self.height, self.tx_index, self.log_index)
    }
}

impl PartialOrd for IndexCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.chain != other.chain {
            return None;
        }
        Some(self.key().cmp(&other.key()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Deposit,
    Withdraw,
}

/// A payment observed by a scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Source-chain tx id, the idempotency key
    pub tx_id: String,
    pub block_height: u64,
    pub tx_index: u32,
    /// Every resolved sender, in input order
    pub from_addresses: Vec<String>,
    pub to_address: String,
    /// Satoshis
    pub amount: u64,
    pub direction: Direction,
    /// Block header time, unix seconds
    pub block_time: i64,
}

impl TransferEvent {
    pub fn primary_sender(&self) -> &str {
        self.from_addresses.first().map(String::as_str).unwrap_or("")
    }
}

/// Deposit saga record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub id: i64,
    pub btc_block_number: u64,
    pub btc_tx_index: u32,
    pub btc_tx_hash: String,
    pub btc_from: String,
    pub btc_froms: Vec<String>,
    pub btc_to: String,
    pub btc_value: u64,
    pub btc_block_time: i64,
    /// Rollup account the sender resolved to
    pub btc_from_aa_address: Option<String>,
    pub mint_status: DepositState,
    pub mint_tx_hash: Option<String>,
    pub mint_retry: i32,
    pub fallback_status: Option<FallbackStatus>,
    pub fallback_tx_hash: Option<String>,
    /// Signed fallback transaction, persisted before broadcast
    pub fallback_raw_tx: Option<Vec<u8>>,
    pub settlement_status: SettlementStatus,
    pub settlement_retry: i32,
    /// Custody service notification matched this record
    pub callback_confirmed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositRecord {
    /// Rollup tx that delivered the funds, mint or fallback.
    ///
    /// A `MintFailed` deposit only has one once the earlier mint was found in
    /// the rollup deposit mirror.
    pub fn credit_tx_hash(&self) -> Option<&str> {
        match self.mint_status {
            DepositState::Confirmed | DepositState::MintFailed => self.mint_tx_hash.as_deref(),
            DepositState::FallbackConfirmed => self.fallback_tx_hash.as_deref(),
            _ => None,
        }
    }
}

/// Side fields written together with a deposit transition; `None` leaves the column as is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepositPatch {
    pub mint_tx_hash: Option<String>,
    pub fallback_tx_hash: Option<String>,
    pub fallback_raw_tx: Option<Vec<u8>>,
    pub resolved_address: Option<String>,
    pub last_error: Option<String>,
}

impl DepositPatch {
    pub fn error(kind: &str) -> Self {
        Self {
            last_error: Some(kind.to_string()),
            ..Default::default()
        }
    }
}

/// Decoded rollup withdraw log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawEvent {
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    /// Rollup account that burned the funds
    pub caller: String,
    /// BTC destination
    pub to_address: String,
    pub original_amount: u64,
    /// Amount actually sent, `original_amount - fee`
    pub amount: u64,
    pub fee: u64,
    pub uuid: String,
}

impl WithdrawEvent {
    /// Idempotency key towards the custody service
    pub fn request_id(&self) -> String {
        request_id(&self.tx_hash, self.log_index)
    }
}

pub fn request_id(rollup_tx_hash: &str, log_index: u32) -> String {
    format!("{}-{}", rollup_tx_hash.trim_start_matches("0x"), log_index)
}

/// Withdrawal saga record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRecord {
    pub id: i64,
    pub request_id: String,
    pub rollup_block_number: u64,
    pub rollup_block_hash: String,
    pub rollup_tx_hash: String,
    pub rollup_tx_index: u32,
    pub rollup_log_index: u32,
    pub rollup_tx_from: String,
    /// Custody address paying out
    pub btc_from: String,
    pub btc_to: String,
    pub btc_value: u64,
    pub btc_real_value: u64,
    pub fee: u64,
    pub uuid: String,
    pub status: WithdrawStatus,
    pub btc_tx_hash: Option<String>,
    pub retry: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything recorded when the custody service accepts a withdrawal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySubmission {
    pub request_id: String,
    pub custody_id: String,
    pub custody_request_id: String,
    pub fee_rate: u64,
    pub custody_state: i32,
    /// Empty until the custody service broadcast the transaction
    pub btc_tx_hash: String,
}

/// Decoded rollup deposit log, mirrored for settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupDepositRecord {
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    pub caller: String,
    pub to_address: String,
    /// Satoshis
    pub amount: u64,
    /// Source BTC tx hash without 0x
    pub btc_tx_hash: String,
}

/// Bridge-module transaction observed on the settlement ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementLedgerEntry {
    pub bridge_event_id: String,
    pub height: u64,
    /// Position among the bridge-module transactions of the block
    pub bridge_module_tx_index: u32,
    pub tx_hash: String,
    pub tx_code: u32,
    pub message_types: Vec<String>,
    pub raw_log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawCheck {
    pub rollup_tx_hash: String,
    pub btc_from: String,
    pub btc_to: String,
    pub btc_value: u64,
}
