//! Withdrawal saga
//!
//! ```text
//! SUBMITTED -> CUSTODY_PENDING -> CUSTODY_BROADCAST -> CONFIRM_WAIT -> FINALIZED
//!                     |
//!                     +-> CUSTODY_FAILED
//! ```
//!
//! The custody service is keyed by the request id derived from the rollup
//! log, and every submission is preceded by a lookup of that id. A request the
//! custody service already knows is adopted, never created twice.
//! `CONFIRM_WAIT -> FINALIZED` belongs to the confirmation watcher.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::BridgeError;
use super::state::WithdrawStatus;
use super::store::WithdrawStore;
use super::types::{CustodySubmission, WithdrawRecord};
use super::worker::Sweep;
use crate::chain::custody::{CustodyTransfer, TransferIntent};
use crate::chain::{ChainError, CustodyApi, FeeRateSource};
use crate::config::CustodyConfig;

pub struct WithdrawOrchestrator<K> {
    custody: Arc<dyn CustodyApi>,
    fees: Arc<dyn FeeRateSource>,
    store: Arc<K>,
    config: CustodyConfig,
    /// Fresh withdrawals wait this long before they are submitted
    submit_delay: Duration,
}

impl<K: WithdrawStore> WithdrawOrchestrator<K> {
    pub fn new(
        custody: Arc<dyn CustodyApi>,
        fees: Arc<dyn FeeRateSource>,
        store: Arc<K>,
        config: CustodyConfig,
        submit_delay: Duration,
    ) -> Self {
        Self {
            custody,
            fees,
            store,
            config,
            submit_delay,
        }
    }

    pub async fn handle_withdraw(&self, record: &WithdrawRecord) -> Result<WithdrawStatus, BridgeError> {
        match record.status {
            WithdrawStatus::Submitted => {
                let moved = self
                    .store
                    .transition_withdraw(record.id, WithdrawStatus::Submitted, WithdrawStatus::CustodyPending)
                    .await?;
                if !moved {
                    return Ok(record.status);
                }
                info!(request_id = %record.request_id, "Withdrawal handed to custody");
                self.submit(record).await
            }
            WithdrawStatus::CustodyPending => self.submit(record).await,
            WithdrawStatus::CustodyBroadcast => self.poll_broadcast(record).await,
            other => Ok(other),
        }
    }

    fn intent(&self, record: &WithdrawRecord) -> TransferIntent {
        TransferIntent {
            request_id: record.request_id.clone(),
            vault_id: self.config.vault_id.clone(),
            wallet_id: self.config.wallet_id.clone(),
            from: record.btc_from.clone(),
            to: record.btc_to.clone(),
            chain_symbol: self.config.chain_symbol.clone(),
            asset_id: self.config.asset_id.clone(),
            amount: record.btc_real_value.to_string(),
        }
    }

    /// Look the request up, create it only if the custody service never saw it
    async fn submit(&self, record: &WithdrawRecord) -> Result<WithdrawStatus, BridgeError> {
        let existing = match self.custody.query_by_request_id(&record.request_id).await {
            Ok(existing) => existing,
            Err(e) => return self.postpone(record, e).await,
        };

        let (transfer, fee_rate) = match existing {
            Some(transfer) => {
                info!(
                    request_id = %record.request_id,
                    custody_id = %transfer.custody_id,
                    "Custody already knows the request, adopting it"
                );
                (transfer, 0)
            }
            None => match self.create(record).await {
                Ok(created) => created,
                Err(e @ ChainError::Rejected(_)) => {
                    warn!(request_id = %record.request_id, "Custody rejected withdrawal: {}", e);
                    self.store.increment_withdraw_retry(record.id, e.kind()).await?;
                    self.store
                        .transition_withdraw(
                            record.id,
                            WithdrawStatus::CustodyPending,
                            WithdrawStatus::CustodyFailed,
                        )
                        .await?;
                    return Ok(WithdrawStatus::CustodyFailed);
                }
                Err(e) => return self.postpone(record, e).await,
            },
        };

        let submission = CustodySubmission {
            request_id: record.request_id.clone(),
            custody_id: transfer.custody_id.clone(),
            custody_request_id: transfer.request_id.clone(),
            fee_rate,
            custody_state: transfer.state,
            btc_tx_hash: transfer.tx_hash.clone(),
        };
        match self.store.record_custody_submission(record.id, &submission).await {
            Ok(true) => {}
            Ok(false) => return Ok(WithdrawStatus::CustodyPending),
            Err(e) if e.is_duplicate() => {
                debug!(request_id = %record.request_id, "Custody submission already recorded");
            }
            Err(e) => return Err(e),
        }

        self.mark_broadcast(record, &transfer).await
    }

    async fn create(&self, record: &WithdrawRecord) -> Result<(CustodyTransfer, u64), ChainError> {
        let intent = self.intent(record);
        let fee = self.custody.estimate_fee(&intent).await?;
        let fee_rate = self.fees.fastest_fee().await?;
        debug!(request_id = %record.request_id, fee = %fee, fee_rate, "Fee quoted");

        let transfer = self.custody.create_transfer(&intent, fee_rate).await?;
        info!(
            request_id = %record.request_id,
            custody_id = %transfer.custody_id,
            to = %record.btc_to,
            amount = record.btc_real_value,
            fee_rate,
            "Custody transfer created"
        );
        Ok((transfer, fee_rate))
    }

    async fn poll_broadcast(&self, record: &WithdrawRecord) -> Result<WithdrawStatus, BridgeError> {
        match self.custody.query_by_request_id(&record.request_id).await {
            Ok(Some(transfer)) => self.mark_broadcast(record, &transfer).await,
            Ok(None) => Err(BridgeError::InvalidRecord(format!(
                "custody lost request {}",
                record.request_id
            ))),
            Err(e) => self.postpone(record, e).await,
        }
    }

    async fn mark_broadcast(
        &self,
        record: &WithdrawRecord,
        transfer: &CustodyTransfer,
    ) -> Result<WithdrawStatus, BridgeError> {
        if transfer.tx_hash.is_empty() {
            debug!(request_id = %record.request_id, "Custody has not broadcast yet");
            return Ok(WithdrawStatus::CustodyBroadcast);
        }
        if self
            .store
            .set_withdraw_broadcast(record.id, &transfer.tx_hash)
            .await?
        {
            info!(
                request_id = %record.request_id,
                btc_tx_hash = %transfer.tx_hash,
                "Withdrawal broadcast"
            );
            Ok(WithdrawStatus::ConfirmWait)
        } else {
            Ok(WithdrawStatus::CustodyBroadcast)
        }
    }

    async fn postpone(&self, record: &WithdrawRecord, e: ChainError) -> Result<WithdrawStatus, BridgeError> {
        self.store.increment_withdraw_retry(record.id, e.kind()).await?;
        Err(e.into())
    }
}

#[async_trait]
impl<K: WithdrawStore> Sweep for WithdrawOrchestrator<K> {
    type Item = WithdrawRecord;

    fn name(&self) -> &'static str {
        "withdraw"
    }

    fn item_key(item: &WithdrawRecord) -> String {
        item.request_id.clone()
    }

    async fn select(&self, limit: usize) -> Result<Vec<WithdrawRecord>, BridgeError> {
        let now = Utc::now();
        let settled = now
            - chrono::Duration::from_std(self.submit_delay)
                .map_err(|e| BridgeError::Internal(format!("submit_delay: {}", e)))?;

        let mut records = Vec::new();
        for (status, before) in [
            (WithdrawStatus::Submitted, settled),
            (WithdrawStatus::CustodyPending, settled),
            (WithdrawStatus::CustodyBroadcast, now),
        ] {
            if records.len() >= limit {
                break;
            }
            let batch = self
                .store
                .find_withdraws(status, before, limit - records.len())
                .await?;
            records.extend(batch);
        }
        Ok(records)
    }

    async fn handle(&self, record: &WithdrawRecord) -> Result<(), BridgeError> {
        self.handle_withdraw(record).await.map(|_| ())
    }
}
