//! Deposit saga
//!
//! Moves a scanned Bitcoin payment to the rollup:
//!
//! ```text
//! PENDING -> MINT_INVOKED -> WAIT_MINED -> CONFIRMED
//!                 |              |
//!                 |              v
//!                 |        WAIT_MINED_FAILED
//!                 |              |
//!                 +--------> FALLBACK_PENDING -> FALLBACK_WAIT_MINED -> FALLBACK_CONFIRMED
//!                 |                 |     ^             |
//!                 |                 |     +-------------+ nonce taken
//!                 v                 +-------------------+--> FALLBACK_FAILED
//!            MINT_FAILED
//! ```
//!
//! Every step is a compare-and-set on the previous state, so a record is only
//! ever advanced by one worker. Each remote call is preceded by a persisted
//! state that makes the call resumable after a crash.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::BridgeError;
use super::state::DepositState;
use super::store::DepositStore;
use super::types::{DepositPatch, DepositRecord};
use super::worker::Sweep;
use crate::chain::{AddressResolver, ChainError, MinedStatus, RollupMinter};
use crate::config::WaitPolicy;

pub struct DepositOrchestrator<K> {
    minter: Arc<dyn RollupMinter>,
    resolver: Arc<dyn AddressResolver>,
    store: Arc<K>,
    mint_wait: WaitPolicy,
    fallback_wait: WaitPolicy,
    /// Age after which a `MintInvoked` record is re-invoked
    stale_after: Duration,
}

impl<K: DepositStore> DepositOrchestrator<K> {
    pub fn new(
        minter: Arc<dyn RollupMinter>,
        resolver: Arc<dyn AddressResolver>,
        store: Arc<K>,
        mint_wait: WaitPolicy,
        fallback_wait: WaitPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            minter,
            resolver,
            store,
            mint_wait,
            fallback_wait,
            stale_after,
        }
    }

    /// Load and advance one deposit
    pub async fn drive(&self, id: i64) -> Result<DepositState, BridgeError> {
        let record = self
            .store
            .get_deposit(id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("deposit {}", id)))?;
        self.handle_deposit(&record).await
    }

    /// Advance a deposit until it is terminal, waiting on a later sweep, or
    /// owned by another worker. Returns the last state this call observed.
    pub async fn handle_deposit(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let mut current = record.clone();
        loop {
            let from = current.mint_status;
            if from.is_terminal() {
                return Ok(from);
            }

            let next = self.step(&current).await?;
            if next == from || next.is_terminal() {
                return Ok(next);
            }

            current = self
                .store
                .get_deposit(current.id)
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("deposit {}", current.id)))?;
            if current.mint_status != next {
                debug!(id = current.id, state = %current.mint_status, "Deposit moved by another worker");
                return Ok(current.mint_status);
            }
        }
    }

    /// Perform the action of the current state and return the state reached
    async fn step(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        match record.mint_status {
            DepositState::Pending => self.begin_mint(record).await,
            DepositState::MintInvoked => self.invoke_mint(record).await,
            DepositState::WaitMined => self.await_mint(record).await,
            DepositState::WaitMinedFailed => {
                self.transition(record, DepositState::FallbackPending, DepositPatch::default())
                    .await
            }
            DepositState::FallbackPending => self.prepare_fallback(record).await,
            DepositState::FallbackWaitMined => self.await_fallback(record).await,
            terminal => Ok(terminal),
        }
    }

    async fn transition(
        &self,
        record: &DepositRecord,
        to: DepositState,
        patch: DepositPatch,
    ) -> Result<DepositState, BridgeError> {
        let from = record.mint_status;
        if self.store.transition_deposit(record.id, from, to, &patch).await? {
            info!(
                id = record.id,
                btc_tx_hash = %record.btc_tx_hash,
                "Deposit {} -> {}",
                from,
                to
            );
            Ok(to)
        } else {
            debug!(id = record.id, %from, %to, "Lost transition race");
            Ok(from)
        }
    }

    async fn begin_mint(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let address = match self.resolver.resolve(&record.btc_from).await {
            Ok(address) => address,
            Err(e) => {
                self.store.increment_deposit_retry(record.id, e.kind()).await?;
                return Err(e.into());
            }
        };

        let patch = DepositPatch {
            resolved_address: Some(address.to_string()),
            ..Default::default()
        };
        self.transition(record, DepositState::MintInvoked, patch).await
    }

    async fn invoke_mint(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let to = self.recipient(record).await?;

        match self
            .minter
            .mint(&record.btc_tx_hash, to, record.btc_value)
            .await
        {
            Ok(hash) => {
                let patch = DepositPatch {
                    mint_tx_hash: Some(hash.to_string()),
                    ..Default::default()
                };
                self.transition(record, DepositState::WaitMined, patch).await
            }
            Err(ChainError::TxHashExists) => {
                warn!(id = record.id, btc_tx_hash = %record.btc_tx_hash, "Source tx already minted");
                self.transition(
                    record,
                    DepositState::MintFailed,
                    DepositPatch::error(ChainError::TxHashExists.kind()),
                )
                .await
            }
            Err(e) if e.triggers_fallback() => {
                warn!(id = record.id, "Mint rejected ({}), falling back to direct transfer", e);
                self.transition(record, DepositState::FallbackPending, DepositPatch::error(e.kind()))
                    .await
            }
            Err(e) => {
                self.transition(record, DepositState::Pending, DepositPatch::error(e.kind()))
                    .await?;
                self.store.increment_deposit_retry(record.id, e.kind()).await?;
                Err(e.into())
            }
        }
    }

    async fn await_mint(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let hash = parse_hash(record.mint_tx_hash.as_deref())?;

        match self.minter.wait_mined(hash, &self.mint_wait).await {
            Ok(MinedStatus::Success) => {
                self.transition(record, DepositState::Confirmed, DepositPatch::default())
                    .await
            }
            Ok(MinedStatus::Reverted) => {
                warn!(id = record.id, mint_tx_hash = %hash, "Mint reverted");
                self.transition(record, DepositState::WaitMinedFailed, DepositPatch::error("REVERTED"))
                    .await
            }
            Err(e @ ChainError::Timeout(_)) => {
                warn!(id = record.id, mint_tx_hash = %hash, "Mint not mined in time");
                self.transition(record, DepositState::WaitMinedFailed, DepositPatch::error(e.kind()))
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn prepare_fallback(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let to = self.recipient(record).await?;

        match self.minter.prepare_transfer(to, record.btc_value).await {
            Ok(signed) => {
                let patch = DepositPatch {
                    fallback_tx_hash: Some(signed.hash.to_string()),
                    fallback_raw_tx: Some(signed.raw.to_vec()),
                    ..Default::default()
                };
                self.transition(record, DepositState::FallbackWaitMined, patch)
                    .await
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(id = record.id, "Fallback transfer cannot be built: {}", e);
                self.transition(record, DepositState::FallbackFailed, DepositPatch::error(e.kind()))
                    .await
            }
        }
    }

    /// (Re)broadcast the persisted fallback bytes and wait for them
    async fn await_fallback(&self, record: &DepositRecord) -> Result<DepositState, BridgeError> {
        let hash = parse_hash(record.fallback_tx_hash.as_deref())?;
        let raw = record
            .fallback_raw_tx
            .as_deref()
            .ok_or_else(|| BridgeError::InvalidRecord(format!("deposit {} has no fallback tx", record.id)))?;

        match self.minter.broadcast(raw).await {
            Ok(_) => {}
            Err(e @ ChainError::NonceTooLow) => {
                warn!(id = record.id, fallback_tx_hash = %hash, "Fallback transfer replaced, signing again");
                return self
                    .transition(record, DepositState::FallbackPending, DepositPatch::error(e.kind()))
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        match self.minter.wait_mined(hash, &self.fallback_wait).await {
            Ok(MinedStatus::Success) => {
                self.transition(record, DepositState::FallbackConfirmed, DepositPatch::default())
                    .await
            }
            Ok(MinedStatus::Reverted) => {
                self.transition(record, DepositState::FallbackFailed, DepositPatch::error("REVERTED"))
                    .await
            }
            Err(e @ ChainError::Timeout(_)) => {
                self.transition(record, DepositState::FallbackFailed, DepositPatch::error(e.kind()))
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recipient(&self, record: &DepositRecord) -> Result<Address, BridgeError> {
        match record.btc_from_aa_address.as_deref() {
            Some(address) => Address::from_str(address).map_err(|e| {
                BridgeError::InvalidRecord(format!("resolved address {}: {}", address, e))
            }),
            None => Ok(self.resolver.resolve(&record.btc_from).await?),
        }
    }
}

fn parse_hash(hash: Option<&str>) -> Result<B256, BridgeError> {
    let hash = hash.ok_or_else(|| BridgeError::InvalidRecord("missing rollup tx hash".into()))?;
    B256::from_str(hash).map_err(|e| BridgeError::InvalidRecord(format!("tx hash {}: {}", hash, e)))
}

#[async_trait]
impl<K: DepositStore> Sweep for DepositOrchestrator<K> {
    type Item = DepositRecord;

    fn name(&self) -> &'static str {
        "deposit"
    }

    fn item_key(item: &DepositRecord) -> String {
        item.btc_tx_hash.clone()
    }

    /// Active deposits plus `MintInvoked` records nobody finished
    async fn select(&self, limit: usize) -> Result<Vec<DepositRecord>, BridgeError> {
        let mut records = self
            .store
            .find_deposits_in(&DepositState::ACTIVE, limit)
            .await?;
        if records.len() < limit {
            let stale_after = chrono::Duration::from_std(self.stale_after)
                .map_err(|e| BridgeError::Internal(format!("stale_after: {}", e)))?;
            let stale = self
                .store
                .find_stale_deposits(
                    DepositState::MintInvoked,
                    Utc::now() - stale_after,
                    limit - records.len(),
                )
                .await?;
            records.extend(stale);
        }
        Ok(records)
    }

    async fn handle(&self, record: &DepositRecord) -> Result<(), BridgeError> {
        self.handle_deposit(record).await.map(|_| ())
    }
}
