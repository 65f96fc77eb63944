//! Rollup Event Scanner
//!
//! Reads the bridge contract's deposit and withdraw logs block by block.
//! Withdraw logs open a withdrawal saga; deposit logs are mirrored for
//! settlement. The cursor is the `(block, tx index, log index)` of the last
//! recorded log, so a partially processed block resumes after that log.

use alloy_primitives::{Address, B256, U256};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::ScannerError;
use super::worker::ScanOutcome;
use crate::bridge::store::{CursorStore, WithdrawStore};
use crate::bridge::types::{ChainKind, IndexCursor, RollupDepositRecord, WithdrawEvent};
use crate::chain::minter::SATS_TO_WEI;
use crate::chain::rollup::{LogFilter, RpcLog};
use crate::chain::RollupRpc;
use crate::config::{RollupConfig, ScanPolicy};

const WORD: usize = 32;

pub struct RollupEventScanner<K> {
    rpc: Arc<dyn RollupRpc>,
    store: Arc<K>,
    contract: Address,
    deposit_topic: B256,
    withdraw_topic: B256,
    /// Paying side of every withdrawal
    custody_address: String,
    policy: ScanPolicy,
}

impl<K> RollupEventScanner<K>
where
    K: CursorStore + WithdrawStore,
{
    pub fn new(
        rpc: Arc<dyn RollupRpc>,
        store: Arc<K>,
        config: &RollupConfig,
        custody_address: &str,
        policy: ScanPolicy,
    ) -> Result<Self, ScannerError> {
        let contract = Address::from_str(&config.bridge_contract)
            .map_err(|e| ScannerError::Config(format!("rollup.bridge_contract: {}", e)))?;
        let deposit_topic = B256::from_str(&config.deposit_topic)
            .map_err(|e| ScannerError::Config(format!("rollup.deposit_topic: {}", e)))?;
        let withdraw_topic = B256::from_str(&config.withdraw_topic)
            .map_err(|e| ScannerError::Config(format!("rollup.withdraw_topic: {}", e)))?;

        Ok(Self {
            rpc,
            store,
            contract,
            deposit_topic,
            withdraw_topic,
            custody_address: custody_address.to_string(),
            policy,
        })
    }

    pub async fn run(&self) {
        info!(contract = %self.contract, "Rollup scanner starting");

        loop {
            match self.scan_once().await {
                ScanOutcome::CaughtUp { .. } => sleep(self.policy.new_block_wait).await,
                ScanOutcome::Advanced { height, events } => {
                    debug!(height, events, "Rollup scanner advanced");
                }
                ScanOutcome::Stalled(e) => {
                    error!("Rollup scan stalled: {}", e);
                    sleep(self.policy.new_block_wait).await;
                }
            }
        }
    }

    pub async fn scan_once(&self) -> ScanOutcome {
        match self.scan_range().await {
            Ok(outcome) => outcome,
            Err(e) => ScanOutcome::Stalled(e),
        }
    }

    async fn scan_range(&self) -> Result<ScanOutcome, ScannerError> {
        let latest = self.rpc.block_number().await?;

        let Some(cursor) = self.store.load_cursor(ChainKind::Rollup).await? else {
            info!(height = latest, "No rollup cursor stored, starting at chain tip");
            self.store
                .save_cursor(&IndexCursor::block_done(ChainKind::Rollup, latest))
                .await?;
            return Ok(ScanOutcome::CaughtUp { height: latest });
        };

        let (start, _) = cursor.next_position();
        if start > latest {
            return Ok(ScanOutcome::CaughtUp { height: cursor.height });
        }

        let mut recorded = 0usize;
        for block in start..=latest {
            let filter = LogFilter {
                from_block: block,
                to_block: block,
                address: self.contract,
                topics: vec![self.deposit_topic, self.withdraw_topic],
            };
            let mut logs = self.rpc.get_logs(&filter).await?;
            logs.sort_by_key(|l| (l.tx_index().unwrap_or(0), l.log_index().unwrap_or(0)));

            for log in &logs {
                if log.removed {
                    warn!(tx_hash = %log.transaction_hash, "Skipping removed log");
                    continue;
                }
                let (tx_index, log_index) = match log_position(log) {
                    Ok(position) => position,
                    Err(e) => {
                        warn!(block, tx_hash = %log.transaction_hash, "Skipping log without position: {}", e);
                        continue;
                    }
                };
                if cursor.covers_log(block, tx_index, log_index) {
                    continue;
                }

                let position = IndexCursor::at_log(ChainKind::Rollup, block, tx_index, log_index);
                match self.record_log(log, &position).await {
                    Ok(true) => recorded += 1,
                    Ok(false) => {}
                    Err(e) if e.is_malformed() => {
                        warn!(
                            block,
                            tx_index,
                            log_index,
                            tx_hash = %log.transaction_hash,
                            "Skipping undecodable bridge log: {}",
                            e
                        );
                        self.store.save_cursor(&position).await?;
                    }
                    Err(e) => return Err(e),
                }
                if !self.policy.tx_interval.is_zero() {
                    sleep(self.policy.tx_interval).await;
                }
            }

            self.store
                .save_cursor(&IndexCursor::block_done(ChainKind::Rollup, block))
                .await?;
            if !self.policy.block_interval.is_zero() {
                sleep(self.policy.block_interval).await;
            }
        }

        Ok(ScanOutcome::Advanced {
            height: latest,
            events: recorded,
        })
    }

    async fn record_log(&self, log: &RpcLog, position: &IndexCursor) -> Result<bool, ScannerError> {
        let topic0 = log.topics.first().copied().unwrap_or_default();

        let inserted = if topic0 == self.withdraw_topic {
            let event = decode_withdraw(log)?;
            let inserted = self
                .store
                .insert_withdraw_with_cursor(&event, &self.custody_address, position)
                .await?;
            if inserted {
                info!(
                    request_id = %event.request_id(),
                    to = %event.to_address,
                    amount = event.amount,
                    fee = event.fee,
                    "Withdraw recorded"
                );
            }
            inserted
        } else if topic0 == self.deposit_topic {
            let record = decode_deposit(log)?;
            let inserted = self
                .store
                .insert_rollup_deposit_with_cursor(&record, position)
                .await?;
            if inserted {
                info!(
                    tx_hash = %record.tx_hash,
                    btc_tx_hash = %record.btc_tx_hash,
                    amount = record.amount,
                    "Rollup deposit recorded"
                );
            }
            inserted
        } else {
            debug!(%topic0, "Ignoring log with unknown topic");
            false
        };

        if !inserted {
            self.store.save_cursor(position).await?;
        }
        Ok(inserted)
    }
}

fn log_position(log: &RpcLog) -> Result<(u32, u32), ScannerError> {
    Ok((to_u32(log.tx_index()?)?, to_u32(log.log_index()?)?))
}

fn to_u32(value: u64) -> Result<u32, ScannerError> {
    u32::try_from(value).map_err(|_| ScannerError::Parse(format!("index {} out of range", value)))
}

fn word(data: &[u8], index: usize) -> Result<U256, ScannerError> {
    data.get(index * WORD..(index + 1) * WORD)
        .map(U256::from_be_slice)
        .ok_or_else(|| ScannerError::Parse(format!("log data has no word {}", index)))
}

fn to_u64(value: U256) -> Result<u64, ScannerError> {
    if value > U256::from(u64::MAX) {
        return Err(ScannerError::Parse(format!("{} does not fit u64", value)));
    }
    Ok(value.to::<u64>())
}

fn topic_address(log: &RpcLog, index: usize) -> Result<Address, ScannerError> {
    log.topics
        .get(index)
        .map(|t| Address::from_word(*t))
        .ok_or_else(|| ScannerError::Parse(format!("log has no topic {}", index)))
}

/// ABI dynamic string whose offset is stored in word `index`
fn abi_string(data: &[u8], index: usize) -> Result<String, ScannerError> {
    let offset = to_usize(word(data, index)?)?;
    let len_start = offset
        .checked_add(WORD)
        .ok_or_else(|| ScannerError::Parse("string offset out of range".into()))?;
    let len_word = data
        .get(offset..len_start)
        .ok_or_else(|| ScannerError::Parse("string offset out of range".into()))?;
    let len = to_usize(U256::from_be_slice(len_word))?;
    let end = len_start
        .checked_add(len)
        .ok_or_else(|| ScannerError::Parse("string length out of range".into()))?;
    let bytes = data
        .get(len_start..end)
        .ok_or_else(|| ScannerError::Parse("string length out of range".into()))?;
    String::from_utf8(bytes.to_vec()).map_err(|e| ScannerError::Parse(e.to_string()))
}

fn to_usize(value: U256) -> Result<usize, ScannerError> {
    usize::try_from(to_u64(value)?)
        .map_err(|_| ScannerError::Parse(format!("{} does not fit usize", value)))
}

/// Withdraw log: caller in topic 1; data holds the destination string offset,
/// original amount, net amount, fee, and the uuid in bytes 128..160
pub fn decode_withdraw(log: &RpcLog) -> Result<WithdrawEvent, ScannerError> {
    let data = log.data.as_ref();
    let caller = topic_address(log, 1)?;
    let uuid = data
        .get(4 * WORD..5 * WORD)
        .map(hex::encode)
        .ok_or_else(|| ScannerError::Parse("withdraw log has no uuid".into()))?;

    Ok(WithdrawEvent {
        block_number: log.block_number()?,
        block_hash: log.block_hash.to_string(),
        tx_hash: log.transaction_hash.to_string(),
        tx_index: to_u32(log.tx_index()?)?,
        log_index: to_u32(log.log_index()?)?,
        caller: caller.to_string(),
        to_address: abi_string(data, 0)?,
        original_amount: to_u64(word(data, 1)?)?,
        amount: to_u64(word(data, 2)?)?,
        fee: to_u64(word(data, 3)?)?,
        uuid,
    })
}

/// Deposit log: caller and recipient in topics 1 and 2; data holds the amount
/// in wei and the source BTC tx hash
pub fn decode_deposit(log: &RpcLog) -> Result<RollupDepositRecord, ScannerError> {
    let data = log.data.as_ref();
    let amount = word(data, 0)? / U256::from(SATS_TO_WEI);
    let btc_tx_hash = data
        .get(WORD..2 * WORD)
        .map(hex::encode)
        .ok_or_else(|| ScannerError::Parse("deposit log has no tx hash".into()))?;

    Ok(RollupDepositRecord {
        block_number: log.block_number()?,
        block_hash: log.block_hash.to_string(),
        tx_hash: log.transaction_hash.to_string(),
        tx_index: to_u32(log.tx_index()?)?,
        log_index: to_u32(log.log_index()?)?,
        caller: topic_address(log, 1)?.to_string(),
        to_address: topic_address(log, 2)?.to_string(),
        amount: to_u64(amount)?,
        btc_tx_hash,
    })
}
