//! Settlement ledger scanner
//!
//! Mirrors bridge-module transactions. The index of an entry counts only the
//! bridge-module transactions of its block, in block order.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::error::ScannerError;
use super::scanner::{BlockSource, ScannedBlock};
use crate::bridge::types::{ChainKind, SettlementLedgerEntry};
use crate::chain::SettlementLedger;
use crate::chain::ledger::LedgerTx;

/// Event attribute carrying the bridge's own event id
const EVENT_ID_ATTRIBUTE: &str = "event_id";

pub struct SettlementLedgerScanner {
    ledger: Arc<dyn SettlementLedger>,
    /// Message type prefix, e.g. `/ethermint.bridge.v1.`
    bridge_module: String,
}

impl SettlementLedgerScanner {
    pub fn new(ledger: Arc<dyn SettlementLedger>, bridge_module: &str) -> Self {
        Self {
            ledger,
            bridge_module: bridge_module.to_string(),
        }
    }

    fn is_bridge_tx(&self, tx: &LedgerTx) -> bool {
        tx.message_types()
            .any(|t| t.starts_with(self.bridge_module.as_str()))
    }

    /// Bridge-module entries of `height` whose index is `>= from_index`
    pub async fn block_bridge_events(
        &self,
        height: u64,
        from_index: u32,
    ) -> Result<Vec<SettlementLedgerEntry>, ScannerError> {
        let txs = self.ledger.block_txs(height).await?;

        let entries: Vec<_> = txs
            .iter()
            .filter(|tx| self.is_bridge_tx(tx))
            .enumerate()
            .filter(|(index, _)| *index as u32 >= from_index)
            .map(|(index, tx)| SettlementLedgerEntry {
                bridge_event_id: tx
                    .attribute(EVENT_ID_ATTRIBUTE)
                    .unwrap_or(&tx.tx_hash)
                    .to_string(),
                height,
                bridge_module_tx_index: index as u32,
                tx_hash: tx.tx_hash.clone(),
                tx_code: tx.code,
                message_types: tx.message_types().map(str::to_string).collect(),
                raw_log: tx.raw_log.clone(),
            })
            .collect();

        debug!(height, txs = txs.len(), entries = entries.len(), "Ledger block scanned");
        Ok(entries)
    }
}

#[async_trait]
impl BlockSource for SettlementLedgerScanner {
    type Event = SettlementLedgerEntry;

    fn chain(&self) -> ChainKind {
        ChainKind::SettlementLedger
    }

    async fn latest_height(&self) -> Result<u64, ScannerError> {
        Ok(self.ledger.latest_height().await?)
    }

    async fn scan_block(
        &self,
        height: u64,
        from_index: u32,
    ) -> Result<ScannedBlock<SettlementLedgerEntry>, ScannerError> {
        let events = self.block_bridge_events(height, from_index).await?;
        Ok(ScannedBlock {
            height,
            hash: String::new(),
            timestamp: 0,
            events,
        })
    }
}
