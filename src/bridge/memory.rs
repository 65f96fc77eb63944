//! In-memory store for tests
//!
//! Enforces the same unique keys and status guards as the PostgreSQL store and
//! records every applied transition so tests can assert on the path taken.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::error::BridgeError;
use super::state::{
    DepositState, FallbackStatus, SettlementStatus, WithdrawStatus, ensure_deposit_transition,
    ensure_settlement_transition, ensure_withdraw_transition,
};
use super::store::{
    CursorStore, DepositStore, LedgerStore, RechargeNotification, Result, WithdrawStore,
};
use super::types::{
    ChainKind, CustodySubmission, DepositPatch, DepositRecord, IndexCursor, RollupDepositRecord,
    SettlementLedgerEntry, TransferEvent, WithdrawCheck, WithdrawEvent, WithdrawRecord,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    cursors: HashMap<ChainKind, IndexCursor>,
    cursor_history: Vec<IndexCursor>,
    deposits: Vec<DepositRecord>,
    deposit_transitions: Vec<(i64, DepositState, DepositState)>,
    withdraws: Vec<WithdrawRecord>,
    withdraw_transitions: Vec<(i64, WithdrawStatus, WithdrawStatus)>,
    custody_rows: Vec<CustodySubmission>,
    audit_rows: usize,
    checks: HashMap<String, WithdrawCheck>,
    rollup_deposits: Vec<RollupDepositRecord>,
    ledger_entries: Vec<SettlementLedgerEntry>,
    notifications: HashMap<String, RechargeNotification>,
    fail_next_write: Option<BridgeError>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next_write.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn advance_cursor(&mut self, cursor: &IndexCursor) -> bool {
        let current = self.cursors.get(&cursor.chain);
        if current.is_some_and(|c| c.key() >= cursor.key()) {
            return false;
        }
        self.cursors.insert(cursor.chain, *cursor);
        self.cursor_history.push(*cursor);
        true
    }

    fn deposit_mut(&mut self, id: i64) -> Result<&mut DepositRecord> {
        self.deposits
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| BridgeError::NotFound(format!("deposit {}", id)))
    }

    fn withdraw_mut(&mut self, id: i64) -> Result<&mut WithdrawRecord> {
        self.withdraws
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| BridgeError::NotFound(format!("withdraw {}", id)))
    }

    fn new_deposit(&mut self, event: &TransferEvent) -> DepositRecord {
        let now = Utc::now();
        DepositRecord {
            id: self.next_id(),
            btc_block_number: event.block_height,
            btc_tx_index: event.tx_index,
            btc_tx_hash: event.tx_id.clone(),
            btc_from: event.primary_sender().to_string(),
            btc_froms: event.from_addresses.clone(),
            btc_to: event.to_address.clone(),
            btc_value: event.amount,
            btc_block_time: event.block_time,
            btc_from_aa_address: None,
            mint_status: DepositState::Pending,
            mint_tx_hash: None,
            mint_retry: 0,
            fallback_status: None,
            fallback_tx_hash: None,
            fallback_raw_tx: None,
            settlement_status: SettlementStatus::Pending,
            settlement_retry: 0,
            callback_confirmed: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next event/cursor write fail with `error`
    pub fn fail_next_write(&self, error: BridgeError) {
        self.inner.lock().unwrap().fail_next_write = Some(error);
    }

    pub fn cursor(&self, chain: ChainKind) -> Option<IndexCursor> {
        self.inner.lock().unwrap().cursors.get(&chain).copied()
    }

    /// Every cursor value ever written, in order
    pub fn cursor_history(&self) -> Vec<IndexCursor> {
        self.inner.lock().unwrap().cursor_history.clone()
    }

    pub fn deposits(&self) -> Vec<DepositRecord> {
        self.inner.lock().unwrap().deposits.clone()
    }

    pub fn deposit_by_hash(&self, btc_tx_hash: &str) -> Option<DepositRecord> {
        self.inner
            .lock()
            .unwrap()
            .deposits
            .iter()
            .find(|d| d.btc_tx_hash == btc_tx_hash)
            .cloned()
    }

    pub fn deposit_transitions(&self) -> Vec<(i64, DepositState, DepositState)> {
        self.inner.lock().unwrap().deposit_transitions.clone()
    }

    pub fn withdraws(&self) -> Vec<WithdrawRecord> {
        self.inner.lock().unwrap().withdraws.clone()
    }

    pub fn withdraw_transitions(&self) -> Vec<(i64, WithdrawStatus, WithdrawStatus)> {
        self.inner.lock().unwrap().withdraw_transitions.clone()
    }

    pub fn custody_rows(&self) -> Vec<CustodySubmission> {
        self.inner.lock().unwrap().custody_rows.clone()
    }

    pub fn audit_rows(&self) -> usize {
        self.inner.lock().unwrap().audit_rows
    }

    pub fn rollup_deposits(&self) -> Vec<RollupDepositRecord> {
        self.inner.lock().unwrap().rollup_deposits.clone()
    }

    pub fn ledger_entries(&self) -> Vec<SettlementLedgerEntry> {
        self.inner.lock().unwrap().ledger_entries.clone()
    }

    pub fn notification(&self, request_id: &str) -> Option<RechargeNotification> {
        self.inner
            .lock()
            .unwrap()
            .notifications
            .get(request_id)
            .cloned()
    }

    pub fn checks(&self) -> usize {
        self.inner.lock().unwrap().checks.len()
    }

    /// Pretend a record was last touched `secs` seconds earlier
    pub fn backdate_deposit(&self, id: i64, secs: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(d) = inner.deposit_mut(id) {
            d.updated_at -= ChronoDuration::seconds(secs);
            d.created_at -= ChronoDuration::seconds(secs);
        }
    }

    pub fn backdate_withdraw(&self, id: i64, secs: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(w) = inner.withdraw_mut(id) {
            w.updated_at -= ChronoDuration::seconds(secs);
            w.created_at -= ChronoDuration::seconds(secs);
        }
    }

    /// Force a deposit into `state`, bypassing the graph (fixture setup only)
    pub fn force_deposit_state(&self, id: i64, state: DepositState) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(d) = inner.deposit_mut(id) {
            d.mint_status = state;
            d.fallback_status = FallbackStatus::for_state(state).or(d.fallback_status);
        }
    }

    pub fn force_settlement_status(&self, id: i64, status: SettlementStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(d) = inner.deposit_mut(id) {
            d.settlement_status = status;
        }
    }

    pub fn force_withdraw_status(&self, id: i64, status: WithdrawStatus, btc_tx_hash: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(w) = inner.withdraw_mut(id) {
            w.status = status;
            w.btc_tx_hash = btc_tx_hash.map(str::to_string);
        }
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, chain: ChainKind) -> Result<Option<IndexCursor>> {
        Ok(self.inner.lock().unwrap().cursors.get(&chain).copied())
    }

    async fn save_cursor(&self, cursor: &IndexCursor) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        Ok(inner.advance_cursor(cursor))
    }
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn insert_deposit_with_cursor(
        &self,
        event: &TransferEvent,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        if inner.deposits.iter().any(|d| d.btc_tx_hash == event.tx_id) {
            return Ok(false);
        }
        let record = inner.new_deposit(event);
        inner.deposits.push(record);
        inner.advance_cursor(cursor);
        Ok(true)
    }

    async fn get_deposit(&self, id: i64) -> Result<Option<DepositRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.deposits.iter().find(|d| d.id == id).cloned())
    }

    async fn get_deposit_by_tx_hash(&self, btc_tx_hash: &str) -> Result<Option<DepositRecord>> {
        Ok(self.deposit_by_hash(btc_tx_hash))
    }

    async fn find_deposits_in(
        &self,
        states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deposits
            .iter()
            .filter(|d| states.contains(&d.mint_status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_stale_deposits(
        &self,
        state: DepositState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deposits
            .iter()
            .filter(|d| d.mint_status == state && d.updated_at < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition_deposit(
        &self,
        id: i64,
        from: DepositState,
        to: DepositState,
        patch: &DepositPatch,
    ) -> Result<bool> {
        ensure_deposit_transition(from, to)?;
        let mut inner = self.inner.lock().unwrap();
        let record = inner.deposit_mut(id)?;
        if record.mint_status != from {
            return Ok(false);
        }
        record.mint_status = to;
        if let Some(fallback) = FallbackStatus::for_state(to) {
            record.fallback_status = Some(fallback);
        }
        if let Some(h) = &patch.mint_tx_hash {
            record.mint_tx_hash = Some(h.clone());
        }
        if let Some(h) = &patch.fallback_tx_hash {
            record.fallback_tx_hash = Some(h.clone());
        }
        if let Some(raw) = &patch.fallback_raw_tx {
            record.fallback_raw_tx = Some(raw.clone());
        }
        if let Some(a) = &patch.resolved_address {
            record.btc_from_aa_address = Some(a.clone());
        }
        if let Some(e) = &patch.last_error {
            record.last_error = Some(e.clone());
        }
        record.updated_at = Utc::now();
        inner.deposit_transitions.push((id, from, to));
        Ok(true)
    }

    async fn increment_deposit_retry(&self, id: i64, last_error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.deposit_mut(id)?;
        record.mint_retry += 1;
        record.last_error = Some(last_error.to_string());
        Ok(())
    }

    async fn find_deposits_by_settlement(
        &self,
        status: SettlementStatus,
        mint_states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deposits
            .iter()
            .filter(|d| d.settlement_status == status)
            .filter(|d| mint_states.is_empty() || mint_states.contains(&d.mint_status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition_settlement(
        &self,
        id: i64,
        from: SettlementStatus,
        to: SettlementStatus,
    ) -> Result<bool> {
        ensure_settlement_transition(from, to)?;
        let mut inner = self.inner.lock().unwrap();
        let record = inner.deposit_mut(id)?;
        if record.settlement_status != from {
            return Ok(false);
        }
        record.settlement_status = to;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_settlement_retry(&self, id: i64, last_error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.deposit_mut(id)?;
        record.settlement_retry += 1;
        record.last_error = Some(last_error.to_string());
        Ok(())
    }

    async fn find_rollup_deposit(&self, btc_tx_hash: &str) -> Result<Option<RollupDepositRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rollup_deposits
            .iter()
            .find(|r| r.btc_tx_hash == btc_tx_hash)
            .cloned())
    }

    async fn record_mint_credit(
        &self,
        id: i64,
        rollup_tx_hash: &str,
        aa_address: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        let record = inner.deposit_mut(id)?;
        if record.mint_status != DepositState::MintFailed || record.mint_tx_hash.is_some() {
            return Ok(false);
        }
        record.mint_tx_hash = Some(rollup_tx_hash.to_string());
        record.btc_from_aa_address.get_or_insert_with(|| aa_address.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_recharge_notification(
        &self,
        notification: &RechargeNotification,
        deposit_id: Option<i64>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.notifications.contains_key(&notification.request_id) {
            return Ok(false);
        }
        if let Some(id) = deposit_id {
            inner.deposit_mut(id)?.callback_confirmed = true;
        }
        inner
            .notifications
            .insert(notification.request_id.clone(), notification.clone());
        Ok(true)
    }

    async fn insert_deposit_from_notify(
        &self,
        notification: &RechargeNotification,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .deposits
            .iter()
            .any(|d| d.btc_tx_hash == notification.tx_hash)
        {
            return Ok(false);
        }
        let event = TransferEvent {
            tx_id: notification.tx_hash.clone(),
            block_height: 0,
            tx_index: 0,
            from_addresses: vec![notification.from.clone()],
            to_address: notification.to.clone(),
            amount: notification.amount,
            direction: super::types::Direction::Deposit,
            block_time: 0,
        };
        let mut record = inner.new_deposit(&event);
        record.callback_confirmed = true;
        inner.deposits.push(record);
        Ok(true)
    }
}

#[async_trait]
impl WithdrawStore for MemoryStore {
    async fn insert_withdraw_with_cursor(
        &self,
        event: &WithdrawEvent,
        btc_from: &str,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        let request_id = event.request_id();
        if inner.withdraws.iter().any(|w| {
            (w.rollup_block_number, w.rollup_tx_index, w.rollup_log_index)
                == (event.block_number, event.tx_index, event.log_index)
                || w.request_id == request_id
        }) {
            return Ok(false);
        }
        let now = Utc::now();
        let record = WithdrawRecord {
            id: inner.next_id(),
            request_id,
            rollup_block_number: event.block_number,
            rollup_block_hash: event.block_hash.clone(),
            rollup_tx_hash: event.tx_hash.clone(),
            rollup_tx_index: event.tx_index,
            rollup_log_index: event.log_index,
            rollup_tx_from: event.caller.clone(),
            btc_from: btc_from.to_string(),
            btc_to: event.to_address.clone(),
            btc_value: event.original_amount,
            btc_real_value: event.amount,
            fee: event.fee,
            uuid: event.uuid.clone(),
            status: WithdrawStatus::Submitted,
            btc_tx_hash: None,
            retry: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        inner.withdraws.push(record);
        inner.advance_cursor(cursor);
        Ok(true)
    }

    async fn insert_rollup_deposit_with_cursor(
        &self,
        record: &RollupDepositRecord,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        if inner.rollup_deposits.iter().any(|r| {
            (r.block_number, r.tx_index, r.log_index)
                == (record.block_number, record.tx_index, record.log_index)
        }) {
            return Ok(false);
        }
        inner.rollup_deposits.push(record.clone());
        inner.advance_cursor(cursor);
        Ok(true)
    }

    async fn get_withdraw(&self, id: i64) -> Result<Option<WithdrawRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.withdraws.iter().find(|w| w.id == id).cloned())
    }

    async fn get_withdraw_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<WithdrawRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .withdraws
            .iter()
            .find(|w| w.request_id == request_id)
            .cloned())
    }

    async fn find_withdraws(
        &self,
        status: WithdrawStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WithdrawRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .withdraws
            .iter()
            .filter(|w| w.status == status && w.updated_at < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
    ) -> Result<bool> {
        ensure_withdraw_transition(from, to)?;
        let mut inner = self.inner.lock().unwrap();
        let record = inner.withdraw_mut(id)?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        record.updated_at = Utc::now();
        inner.withdraw_transitions.push((id, from, to));
        Ok(true)
    }

    async fn record_custody_submission(
        &self,
        id: i64,
        submission: &CustodySubmission,
    ) -> Result<bool> {
        let (from, to) = (WithdrawStatus::CustodyPending, WithdrawStatus::CustodyBroadcast);
        ensure_withdraw_transition(from, to)?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .custody_rows
            .iter()
            .any(|c| c.request_id == submission.request_id)
        {
            return Err(BridgeError::Duplicate(submission.request_id.clone()));
        }
        let record = inner.withdraw_mut(id)?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        if !submission.btc_tx_hash.is_empty() {
            record.btc_tx_hash = Some(submission.btc_tx_hash.clone());
        }
        record.updated_at = Utc::now();
        inner.withdraw_transitions.push((id, from, to));
        inner.custody_rows.push(submission.clone());
        inner.audit_rows += 1;
        Ok(true)
    }

    async fn set_withdraw_broadcast(&self, id: i64, btc_tx_hash: &str) -> Result<bool> {
        let (from, to) = (WithdrawStatus::CustodyBroadcast, WithdrawStatus::ConfirmWait);
        ensure_withdraw_transition(from, to)?;
        let mut inner = self.inner.lock().unwrap();
        let record = inner.withdraw_mut(id)?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        record.btc_tx_hash = Some(btc_tx_hash.to_string());
        record.updated_at = Utc::now();
        inner.withdraw_transitions.push((id, from, to));
        Ok(true)
    }

    async fn find_confirm_wait(&self, limit: usize) -> Result<Vec<WithdrawRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .withdraws
            .iter()
            .filter(|w| w.status == WithdrawStatus::ConfirmWait)
            .filter(|w| w.btc_tx_hash.as_deref().is_some_and(|h| !h.is_empty()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_withdraw_check(&self, check: &WithdrawCheck) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.checks.contains_key(&check.rollup_tx_hash) {
            return Ok(false);
        }
        inner.checks.insert(check.rollup_tx_hash.clone(), check.clone());
        Ok(true)
    }

    async fn increment_withdraw_retry(&self, id: i64, last_error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.withdraw_mut(id)?;
        record.retry += 1;
        record.last_error = Some(last_error.to_string());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_ledger_entry_with_cursor(
        &self,
        entry: &SettlementLedgerEntry,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        if inner
            .ledger_entries
            .iter()
            .any(|e| e.bridge_event_id == entry.bridge_event_id)
        {
            return Ok(false);
        }
        inner.ledger_entries.push(entry.clone());
        inner.advance_cursor(cursor);
        Ok(true)
    }
}
