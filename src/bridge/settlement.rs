//! Settlement ledger leg of a deposit
//!
//! Two sweeps over deposit records:
//! - create: every scanned deposit gets a pending ledger entry keyed by its
//!   source tx hash. `IndexExists` means an earlier attempt already landed.
//! - update: once the mint saga credited the funds, the ledger entry is
//!   marked completed with the rollup tx hash that delivered them. A
//!   `MintFailed` deposit was minted by an earlier invocation; its rollup tx
//!   hash comes from the mirrored rollup deposit log.
//!
//! A ledger entry that disagrees with the local record is never overwritten;
//! the record ends in `Mismatch` for an operator.

use alloy_primitives::Address;
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::BridgeError;
use super::state::{DepositState, SettlementStatus};
use super::store::DepositStore;
use super::types::{DepositRecord, RollupDepositRecord};
use super::worker::Sweep;
use crate::chain::ledger::{
    CreateDepositRequest, LedgerDeposit, LedgerDepositStatus, UpdateDepositRequest,
};
use crate::chain::{ChainError, SettlementLedger};

/// Mint outcomes after which the ledger entry can be completed
const SETTLEABLE: [DepositState; 3] = [
    DepositState::Confirmed,
    DepositState::FallbackConfirmed,
    DepositState::MintFailed,
];

/// Outcome of matching a `MintFailed` deposit against the rollup mirror
enum Reconciliation {
    Credited { tx_hash: String, aa_address: String },
    /// The rollup scanner has not reached the earlier mint yet
    NotMirrored,
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPhase {
    Create,
    Update,
}

pub struct SettlementOrchestrator<K> {
    ledger: Arc<dyn SettlementLedger>,
    store: Arc<K>,
    phase: SettlementPhase,
}

impl<K: DepositStore> SettlementOrchestrator<K> {
    pub fn new(ledger: Arc<dyn SettlementLedger>, store: Arc<K>, phase: SettlementPhase) -> Self {
        Self {
            ledger,
            store,
            phase,
        }
    }

    /// `Pending -> Created`
    pub async fn create_entry(&self, record: &DepositRecord) -> Result<SettlementStatus, BridgeError> {
        let value = i64::try_from(record.btc_value)
            .map_err(|_| BridgeError::InvalidRecord(format!("value {} out of range", record.btc_value)))?;
        let request = CreateDepositRequest {
            tx_hash: record.btc_tx_hash.clone(),
            from: record.btc_from.clone(),
            to: record.btc_to.clone(),
            value,
        };

        match self.ledger.create_deposit(&request).await {
            Ok(ledger_tx) => {
                info!(btc_tx_hash = %record.btc_tx_hash, %ledger_tx, "Ledger deposit created");
            }
            Err(ChainError::IndexExists) => {
                info!(btc_tx_hash = %record.btc_tx_hash, "Ledger deposit already exists");
            }
            Err(e) => {
                self.store.increment_settlement_retry(record.id, e.kind()).await?;
                return Err(e.into());
            }
        }

        self.transition(record, SettlementStatus::Pending, SettlementStatus::Created)
            .await
    }

    /// `Created -> Completed | Mismatch`
    pub async fn complete_entry(&self, record: &DepositRecord) -> Result<SettlementStatus, BridgeError> {
        let (credit_tx, from_aa) = match (record.credit_tx_hash(), record.mint_status) {
            (Some(hash), _) => (
                hash.to_string(),
                record.btc_from_aa_address.clone().unwrap_or_default(),
            ),
            (None, DepositState::MintFailed) => match self.reconcile(record).await? {
                Reconciliation::Credited {
                    tx_hash,
                    aa_address,
                } => (tx_hash, aa_address),
                Reconciliation::NotMirrored => return Ok(record.settlement_status),
                Reconciliation::Mismatch => return self.mismatch(record).await,
            },
            (None, state) => {
                return Err(BridgeError::InvalidRecord(format!(
                    "deposit {} is {}, not credited",
                    record.id, state
                )));
            }
        };

        let entry = match self.ledger.query_deposit(&record.btc_tx_hash).await {
            Ok(entry) => entry,
            Err(e) => {
                self.store.increment_settlement_retry(record.id, e.kind()).await?;
                return Err(e.into());
            }
        };

        match entry.status {
            LedgerDepositStatus::Completed => {
                return self
                    .transition(record, SettlementStatus::Created, SettlementStatus::Completed)
                    .await;
            }
            LedgerDepositStatus::Unknown => {
                warn!(btc_tx_hash = %record.btc_tx_hash, "Ledger deposit in unknown status");
                return self.mismatch(record).await;
            }
            LedgerDepositStatus::Pending => {}
        }

        if !matches_record(&entry, record) {
            warn!(
                btc_tx_hash = %record.btc_tx_hash,
                ledger_from = %entry.from,
                ledger_to = %entry.to,
                ledger_value = entry.value,
                "Ledger deposit differs from local record"
            );
            return self.mismatch(record).await;
        }

        let request = UpdateDepositRequest {
            status: LedgerDepositStatus::Completed,
            rollup_tx_hash: credit_tx,
            from_aa,
        };
        match self.ledger.update_deposit(&record.btc_tx_hash, &request).await {
            Ok(ledger_tx) => {
                info!(btc_tx_hash = %record.btc_tx_hash, %ledger_tx, "Ledger deposit completed");
                self.transition(record, SettlementStatus::Created, SettlementStatus::Completed)
                    .await
            }
            Err(ChainError::InvalidStatus) => self.mismatch(record).await,
            Err(e) => {
                self.store.increment_settlement_retry(record.id, e.kind()).await?;
                Err(e.into())
            }
        }
    }

    /// Find the earlier mint of a `MintFailed` deposit and attach its tx hash
    async fn reconcile(&self, record: &DepositRecord) -> Result<Reconciliation, BridgeError> {
        let Some(mirror) = self.store.find_rollup_deposit(&record.btc_tx_hash).await? else {
            debug!(btc_tx_hash = %record.btc_tx_hash, "Earlier mint not mirrored yet");
            return Ok(Reconciliation::NotMirrored);
        };

        if !mirror_matches(&mirror, record) {
            warn!(
                btc_tx_hash = %record.btc_tx_hash,
                rollup_tx_hash = %mirror.tx_hash,
                mirror_to = %mirror.to_address,
                mirror_amount = mirror.amount,
                "Rollup deposit differs from local record"
            );
            return Ok(Reconciliation::Mismatch);
        }

        self.store
            .record_mint_credit(record.id, &mirror.tx_hash, &mirror.to_address)
            .await?;
        info!(
            btc_tx_hash = %record.btc_tx_hash,
            rollup_tx_hash = %mirror.tx_hash,
            "Earlier mint attached to deposit"
        );
        Ok(Reconciliation::Credited {
            tx_hash: mirror.tx_hash,
            aa_address: record
                .btc_from_aa_address
                .clone()
                .unwrap_or(mirror.to_address),
        })
    }

    async fn mismatch(&self, record: &DepositRecord) -> Result<SettlementStatus, BridgeError> {
        self.transition(record, SettlementStatus::Created, SettlementStatus::Mismatch)
            .await
    }

    async fn transition(
        &self,
        record: &DepositRecord,
        from: SettlementStatus,
        to: SettlementStatus,
    ) -> Result<SettlementStatus, BridgeError> {
        if self.store.transition_settlement(record.id, from, to).await? {
            Ok(to)
        } else {
            Ok(record.settlement_status)
        }
    }
}

fn matches_record(entry: &LedgerDeposit, record: &DepositRecord) -> bool {
    entry.from == record.btc_from
        && entry.to == record.btc_to
        && u64::try_from(entry.value).is_ok_and(|v| v == record.btc_value)
}

/// Same amount, and the same recipient when the deposit resolved one
fn mirror_matches(mirror: &RollupDepositRecord, record: &DepositRecord) -> bool {
    if mirror.amount != record.btc_value {
        return false;
    }
    match record.btc_from_aa_address.as_deref() {
        Some(resolved) => match (Address::from_str(resolved), Address::from_str(&mirror.to_address)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        None => true,
    }
}

#[async_trait]
impl<K: DepositStore> Sweep for SettlementOrchestrator<K> {
    type Item = DepositRecord;

    fn name(&self) -> &'static str {
        match self.phase {
            SettlementPhase::Create => "settlement_create",
            SettlementPhase::Update => "settlement_update",
        }
    }

    fn item_key(item: &DepositRecord) -> String {
        item.btc_tx_hash.clone()
    }

    async fn select(&self, limit: usize) -> Result<Vec<DepositRecord>, BridgeError> {
        match self.phase {
            SettlementPhase::Create => {
                self.store
                    .find_deposits_by_settlement(SettlementStatus::Pending, &[], limit)
                    .await
            }
            SettlementPhase::Update => {
                self.store
                    .find_deposits_by_settlement(SettlementStatus::Created, &SETTLEABLE, limit)
                    .await
            }
        }
    }

    async fn handle(&self, record: &DepositRecord) -> Result<(), BridgeError> {
        match self.phase {
            SettlementPhase::Create => self.create_entry(record).await.map(|_| ()),
            SettlementPhase::Update => self.complete_entry(record).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::memory::MemoryStore;
    use crate::bridge::store::WithdrawStore;
    use crate::bridge::types::{ChainKind, DepositPatch, Direction, IndexCursor, TransferEvent};
    use crate::chain::ledger::fake::FakeLedger;
    use std::sync::atomic::Ordering;

    const BTC_TX: &str = "aa11";

    struct Harness {
        ledger: Arc<FakeLedger>,
        store: Arc<MemoryStore>,
        create: SettlementOrchestrator<MemoryStore>,
        update: SettlementOrchestrator<MemoryStore>,
        id: i64,
    }

    async fn harness() -> Harness {
        let ledger = Arc::new(FakeLedger::default());
        let store = Arc::new(MemoryStore::new());
        let event = TransferEvent {
            tx_id: BTC_TX.to_string(),
            block_height: 3,
            tx_index: 1,
            from_addresses: vec!["bcrt1qalice".to_string()],
            to_address: "bcrt1qcustody".to_string(),
            amount: 11,
            direction: Direction::Deposit,
            block_time: 0,
        };
        store
            .insert_deposit_with_cursor(&event, &IndexCursor::after_tx(ChainKind::Bitcoin, 3, 1))
            .await
            .unwrap();
        let id = store.deposits()[0].id;
        Harness {
            create: SettlementOrchestrator::new(ledger.clone(), store.clone(), SettlementPhase::Create),
            update: SettlementOrchestrator::new(ledger.clone(), store.clone(), SettlementPhase::Update),
            ledger,
            store,
            id,
        }
    }

    impl Harness {
        fn record(&self) -> DepositRecord {
            self.store.deposits()[0].clone()
        }

        /// Mint confirmed and ledger entry created
        async fn credited(&self) {
            use DepositState::*;
            let patch = DepositPatch {
                mint_tx_hash: Some("0xm1".to_string()),
                ..Default::default()
            };
            for (from, to) in [(Pending, MintInvoked), (MintInvoked, WaitMined), (WaitMined, Confirmed)] {
                assert!(self.store.transition_deposit(self.id, from, to, &patch).await.unwrap());
            }
            let sweep = self.create.select(10).await.unwrap();
            self.create.handle(&sweep[0]).await.unwrap();
        }

        /// Mint answered TxHashExists and ledger entry created
        async fn minted_earlier(&self) {
            use DepositState::*;
            let patch = DepositPatch {
                resolved_address: Some(aa().to_string()),
                ..Default::default()
            };
            for (from, to) in [(Pending, MintInvoked), (MintInvoked, MintFailed)] {
                assert!(self.store.transition_deposit(self.id, from, to, &patch).await.unwrap());
            }
            let sweep = self.create.select(10).await.unwrap();
            self.create.handle(&sweep[0]).await.unwrap();
        }

        async fn mirror(&self, to: Address, amount: u64) {
            let record = RollupDepositRecord {
                block_number: 40,
                block_hash: "0xb40".to_string(),
                tx_hash: MIRRORED_TX.to_string(),
                tx_index: 0,
                log_index: 2,
                caller: Address::with_last_byte(0xca).to_string(),
                to_address: to.to_string(),
                amount,
                btc_tx_hash: BTC_TX.to_string(),
            };
            self.store
                .insert_rollup_deposit_with_cursor(&record, &IndexCursor::at_log(ChainKind::Rollup, 40, 0, 2))
                .await
                .unwrap();
        }
    }

    const MIRRORED_TX: &str = "0xr0";

    fn aa() -> Address {
        Address::with_last_byte(0x42)
    }

    #[tokio::test]
    async fn test_create_entry() {
        let h = harness().await;

        let status = h.create.create_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Created);
        let entry = h.ledger.deposit(BTC_TX).unwrap();
        assert_eq!(entry.value, 11);
        assert_eq!(entry.from, "bcrt1qalice");
        assert_eq!(entry.status, LedgerDepositStatus::Pending);
    }

    #[tokio::test]
    async fn test_existing_entry_counts_as_created() {
        let h = harness().await;
        h.create.create_entry(&h.record()).await.unwrap();
        h.store.force_settlement_status(h.id, SettlementStatus::Pending);

        let status = h.create.create_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Created);
        assert_eq!(h.ledger.create_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.record().settlement_retry, 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_retried() {
        let h = harness().await;
        *h.ledger.create_error.lock().unwrap() = Some(ChainError::NotAuthorized);

        assert!(h.create.create_entry(&h.record()).await.is_err());
        let record = h.record();
        assert_eq!(record.settlement_status, SettlementStatus::Pending);
        assert_eq!(record.settlement_retry, 1);
        assert_eq!(record.last_error.as_deref(), Some("NOT_AUTHORIZED"));
    }

    #[tokio::test]
    async fn test_update_waits_for_credit() {
        let h = harness().await;
        h.create.create_entry(&h.record()).await.unwrap();

        assert!(h.update.select(10).await.unwrap().is_empty());

        h.store.force_deposit_state(h.id, DepositState::FallbackConfirmed);
        assert_eq!(h.update.select(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_completes_entry() {
        let h = harness().await;
        h.credited().await;

        let status = h.update.complete_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Completed);
        assert_eq!(
            h.ledger.deposit(BTC_TX).unwrap().status,
            LedgerDepositStatus::Completed
        );
        assert_eq!(h.ledger.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_completed_skips_update() {
        let h = harness().await;
        h.credited().await;
        h.ledger
            .deposits
            .lock()
            .unwrap()
            .get_mut(BTC_TX)
            .unwrap()
            .status = LedgerDepositStatus::Completed;

        let status = h.update.complete_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Completed);
        assert_eq!(h.ledger.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_value_mismatch_is_terminal() {
        let h = harness().await;
        h.credited().await;
        h.ledger
            .deposits
            .lock()
            .unwrap()
            .get_mut(BTC_TX)
            .unwrap()
            .value = 12;

        let status = h.update.complete_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Mismatch);
        assert_eq!(h.ledger.update_calls.load(Ordering::SeqCst), 0);
        assert!(h.update.select(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mint_failed_completes_from_rollup_mirror() {
        let h = harness().await;
        h.minted_earlier().await;
        h.mirror(aa(), 11).await;

        let selected = h.update.select(10).await.unwrap();
        assert_eq!(selected.len(), 1);
        h.update.handle(&selected[0]).await.unwrap();

        let record = h.record();
        assert_eq!(record.mint_status, DepositState::MintFailed);
        assert_eq!(record.settlement_status, SettlementStatus::Completed);
        assert_eq!(record.credit_tx_hash(), Some(MIRRORED_TX));
        let entry = h.ledger.deposit(BTC_TX).unwrap();
        assert_eq!(entry.status, LedgerDepositStatus::Completed);
        let (_, update) = h.ledger.updates.lock().unwrap()[0].clone();
        assert_eq!(update.rollup_tx_hash, MIRRORED_TX);
        assert_eq!(update.from_aa, aa().to_string());
        assert!(h.update.select(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mint_failed_waits_for_mirror() {
        let h = harness().await;
        h.minted_earlier().await;

        let status = h.update.complete_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Created);
        assert_eq!(h.ledger.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.record().settlement_retry, 0);
        assert_eq!(h.update.select(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_for_other_recipient_is_mismatch() {
        let h = harness().await;
        h.minted_earlier().await;
        h.mirror(Address::with_last_byte(0x99), 11).await;

        let status = h.update.complete_entry(&h.record()).await.unwrap();

        assert_eq!(status, SettlementStatus::Mismatch);
        assert_eq!(h.record().mint_tx_hash, None);
        assert_eq!(h.ledger.update_calls.load(Ordering::SeqCst), 0);
    }
}
