//! Confirmation Watcher
//!
//! Polls broadcast withdrawals and finalizes each one once its Bitcoin
//! transaction reaches the configured depth:
//! CONFIRM_WAIT -> FINALIZED
//!
//! Lookup failures only postpone a record to the next poll.

use async_trait::async_trait;
use bitcoincore_rpc::bitcoin::Txid;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bridge::state::WithdrawStatus;
use crate::bridge::store::WithdrawStore;
use crate::bridge::types::WithdrawRecord;
use crate::bridge::worker::Sweep;
use crate::bridge::BridgeError;
use crate::chain::{BitcoinRpc, ChainError};

pub struct ConfirmationWatcher<K> {
    rpc: Arc<dyn BitcoinRpc>,
    store: Arc<K>,
    required: u32,
}

impl<K: WithdrawStore> ConfirmationWatcher<K> {
    pub fn new(rpc: Arc<dyn BitcoinRpc>, store: Arc<K>, required: u32) -> Self {
        Self {
            rpc,
            store,
            required,
        }
    }

    /// Returns whether this call finalized the withdrawal
    pub async fn check(&self, record: &WithdrawRecord) -> Result<bool, BridgeError> {
        let hash = record.btc_tx_hash.as_deref().unwrap_or_default();
        let txid = Txid::from_str(hash)
            .map_err(|e| BridgeError::InvalidRecord(format!("btc_tx_hash {}: {}", hash, e)))?;

        let confirmations = self.rpc.transaction_confirmations(&txid).await?;
        if confirmations < self.required {
            debug!(
                request_id = %record.request_id,
                confirmations,
                required = self.required,
                "Withdrawal not final yet"
            );
            return Ok(false);
        }

        let finalized = self
            .store
            .transition_withdraw(record.id, WithdrawStatus::ConfirmWait, WithdrawStatus::Finalized)
            .await?;
        if finalized {
            info!(
                request_id = %record.request_id,
                btc_tx_hash = %hash,
                confirmations,
                "Withdrawal finalized"
            );
        }
        Ok(finalized)
    }
}

#[async_trait]
impl<K: WithdrawStore> Sweep for ConfirmationWatcher<K> {
    type Item = WithdrawRecord;

    fn name(&self) -> &'static str {
        "confirmation"
    }

    fn item_key(item: &WithdrawRecord) -> String {
        item.request_id.clone()
    }

    async fn select(&self, limit: usize) -> Result<Vec<WithdrawRecord>, BridgeError> {
        self.store.find_confirm_wait(limit).await
    }

    async fn handle(&self, record: &WithdrawRecord) -> Result<(), BridgeError> {
        match self.check(record).await {
            Ok(_) => Ok(()),
            // Not yet known to the node, e.g. still propagating
            Err(BridgeError::Chain(ChainError::NotFound(_))) => {
                debug!(request_id = %record.request_id, "Withdrawal transaction not found yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::memory::MemoryStore;
    use crate::bridge::types::{ChainKind, IndexCursor, WithdrawEvent};
    use crate::bridge::worker::SweepWorker;
    use crate::chain::bitcoin::fake::FakeBitcoin;
    use crate::config::SweepPolicy;
    use bitcoincore_rpc::bitcoin::hashes::Hash;

    fn txid() -> Txid {
        Txid::from_byte_array([7; 32])
    }

    async fn confirm_wait_withdraw(store: &MemoryStore, btc_tx_hash: &str) -> WithdrawRecord {
        let event = WithdrawEvent {
            block_number: 5,
            block_hash: "0x05".to_string(),
            tx_hash: "0xaa".to_string(),
            tx_index: 0,
            log_index: 1,
            caller: "0xca".to_string(),
            to_address: "bcrt1qdest".to_string(),
            original_amount: 1_000,
            amount: 900,
            fee: 100,
            uuid: "00".repeat(32),
        };
        store
            .insert_withdraw_with_cursor(&event, "bcrt1qcustody", &IndexCursor::after_tx(ChainKind::Rollup, 5, 0))
            .await
            .unwrap();
        let record = store.withdraws().pop().unwrap();
        store.force_withdraw_status(record.id, WithdrawStatus::ConfirmWait, Some(btc_tx_hash));
        store.get_withdraw(record.id).await.unwrap().unwrap()
    }

    fn policy() -> SweepPolicy {
        SweepPolicy {
            item_delay: std::time::Duration::ZERO,
            error_backoff: std::time::Duration::ZERO,
            ..SweepPolicy::confirmation()
        }
    }

    #[tokio::test]
    async fn test_below_threshold_stays_confirm_wait() {
        let rpc = Arc::new(FakeBitcoin::default());
        rpc.set_confirmations(txid(), 5);
        let store = Arc::new(MemoryStore::new());
        let record = confirm_wait_withdraw(&store, &txid().to_string()).await;
        let watcher = ConfirmationWatcher::new(rpc, store.clone(), 6);

        assert!(!watcher.check(&record).await.unwrap());
        let stored = store.get_withdraw(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawStatus::ConfirmWait);
    }

    #[tokio::test]
    async fn test_threshold_finalizes_exactly_once() {
        let rpc = Arc::new(FakeBitcoin::default());
        rpc.set_confirmations(txid(), 6);
        let store = Arc::new(MemoryStore::new());
        let record = confirm_wait_withdraw(&store, &txid().to_string()).await;
        let worker = SweepWorker::new(ConfirmationWatcher::new(rpc, store.clone(), 6), policy());

        let first = worker.sweep_once().await;
        let second = worker.sweep_once().await;

        assert_eq!(first.succeeded, 1);
        assert_eq!(second.selected, 0);
        let stored = store.get_withdraw(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawStatus::Finalized);
        assert_eq!(
            store.withdraw_transitions(),
            vec![(record.id, WithdrawStatus::ConfirmWait, WithdrawStatus::Finalized)]
        );

        // A stale read of the same record does not finalize twice
        assert!(!worker.sweep().check(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_transaction_postponed() {
        let rpc = Arc::new(FakeBitcoin::default());
        let store = Arc::new(MemoryStore::new());
        let record = confirm_wait_withdraw(&store, &txid().to_string()).await;
        let worker = SweepWorker::new(ConfirmationWatcher::new(rpc, store.clone(), 6), policy());

        let report = worker.sweep_once().await;

        assert_eq!(report.succeeded, 1);
        let stored = store.get_withdraw(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawStatus::ConfirmWait);
    }

    #[tokio::test]
    async fn test_malformed_hash_is_an_item_error() {
        let rpc = Arc::new(FakeBitcoin::default());
        let store = Arc::new(MemoryStore::new());
        let record = confirm_wait_withdraw(&store, "not-a-txid").await;
        let watcher = ConfirmationWatcher::new(rpc, store.clone(), 6);

        assert!(matches!(
            watcher.handle(&record).await,
            Err(BridgeError::InvalidRecord(_))
        ));
    }
}
