//! Persistence seams
//!
//! Workers and orchestrators depend on these traits only. Every method that
//! exposes a scanned event also writes the cursor that covers it, in one
//! transaction. Every status change is a compare-and-set on the expected
//! previous status and returns `false` when another writer got there first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::BridgeError;
use super::state::{DepositState, SettlementStatus, WithdrawStatus};
use super::types::{
    ChainKind, CustodySubmission, DepositPatch, DepositRecord, IndexCursor, RollupDepositRecord,
    SettlementLedgerEntry, TransferEvent, WithdrawCheck, WithdrawEvent, WithdrawRecord,
};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, chain: ChainKind) -> Result<Option<IndexCursor>>;

    /// Never moves a stored cursor backwards; returns whether the row changed
    async fn save_cursor(&self, cursor: &IndexCursor) -> Result<bool>;
}

/// Custody service recharge notification, stored once per request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechargeNotification {
    pub request_id: String,
    pub request_type: i32,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub raw: String,
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Insert a `Pending` deposit and advance the cursor atomically.
    ///
    /// `Ok(false)` when the tx hash is already recorded; the cursor is not
    /// written in that case.
    async fn insert_deposit_with_cursor(
        &self,
        event: &TransferEvent,
        cursor: &IndexCursor,
    ) -> Result<bool>;

    async fn get_deposit(&self, id: i64) -> Result<Option<DepositRecord>>;

    async fn get_deposit_by_tx_hash(&self, btc_tx_hash: &str) -> Result<Option<DepositRecord>>;

    /// Oldest first
    async fn find_deposits_in(
        &self,
        states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>>;

    /// Deposits left in `state` since before `before`
    async fn find_stale_deposits(
        &self,
        state: DepositState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DepositRecord>>;

    /// CAS `from -> to` plus side fields. Illegal edges are rejected with
    /// `InvalidStateTransition` before touching storage.
    async fn transition_deposit(
        &self,
        id: i64,
        from: DepositState,
        to: DepositState,
        patch: &DepositPatch,
    ) -> Result<bool>;

    async fn increment_deposit_retry(&self, id: i64, last_error: &str) -> Result<()>;

    async fn find_deposits_by_settlement(
        &self,
        status: SettlementStatus,
        mint_states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>>;

    async fn transition_settlement(
        &self,
        id: i64,
        from: SettlementStatus,
        to: SettlementStatus,
    ) -> Result<bool>;

    async fn increment_settlement_retry(&self, id: i64, last_error: &str) -> Result<()>;

    /// Mirrored rollup deposit log carrying this source tx hash
    async fn find_rollup_deposit(&self, btc_tx_hash: &str) -> Result<Option<RollupDepositRecord>>;

    /// Attach the rollup tx of an earlier mint to a `MintFailed` deposit.
    ///
    /// `Ok(false)` when the record is in another state or already has one.
    async fn record_mint_credit(&self, id: i64, rollup_tx_hash: &str, aa_address: &str)
    -> Result<bool>;

    /// Store the notification and mark the matching deposit in one transaction.
    ///
    /// `Ok(false)` when the request id was already stored.
    async fn record_recharge_notification(
        &self,
        notification: &RechargeNotification,
        deposit_id: Option<i64>,
    ) -> Result<bool>;

    /// Create a `Pending` deposit reported by the custody service before the
    /// scanner saw it. `Ok(false)` when the tx hash is already recorded.
    async fn insert_deposit_from_notify(
        &self,
        notification: &RechargeNotification,
    ) -> Result<bool>;
}

#[async_trait]
pub trait WithdrawStore: Send + Sync {
    /// Insert a `Submitted` withdrawal and advance the rollup cursor atomically.
    /// `Ok(false)` when the log triple is already recorded.
    async fn insert_withdraw_with_cursor(
        &self,
        event: &WithdrawEvent,
        btc_from: &str,
        cursor: &IndexCursor,
    ) -> Result<bool>;

    async fn insert_rollup_deposit_with_cursor(
        &self,
        record: &RollupDepositRecord,
        cursor: &IndexCursor,
    ) -> Result<bool>;

    async fn get_withdraw(&self, id: i64) -> Result<Option<WithdrawRecord>>;

    async fn get_withdraw_by_request_id(&self, request_id: &str)
    -> Result<Option<WithdrawRecord>>;

    /// Withdrawals in `status` last updated before `before`, oldest first
    async fn find_withdraws(
        &self,
        status: WithdrawStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WithdrawRecord>>;

    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
    ) -> Result<bool>;

    /// `CustodyPending -> CustodyBroadcast` with the custody and audit rows, one transaction
    async fn record_custody_submission(
        &self,
        id: i64,
        submission: &CustodySubmission,
    ) -> Result<bool>;

    /// `CustodyBroadcast -> ConfirmWait` once the broadcast hash is known
    async fn set_withdraw_broadcast(&self, id: i64, btc_tx_hash: &str) -> Result<bool>;

    /// `ConfirmWait` withdrawals with a broadcast hash
    async fn find_confirm_wait(&self, limit: usize) -> Result<Vec<WithdrawRecord>>;

    /// `Ok(false)` when the rollup tx hash was already checked
    async fn record_withdraw_check(&self, check: &WithdrawCheck) -> Result<bool>;

    async fn increment_withdraw_retry(&self, id: i64, last_error: &str) -> Result<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// `Ok(false)` when the event id is already recorded
    async fn insert_ledger_entry_with_cursor(
        &self,
        entry: &SettlementLedgerEntry,
        cursor: &IndexCursor,
    ) -> Result<bool>;
}
