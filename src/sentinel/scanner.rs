use async_trait::async_trait;

use super::error::ScannerError;
use crate::bridge::store::{DepositStore, LedgerStore};
use crate::bridge::types::{ChainKind, IndexCursor, SettlementLedgerEntry, TransferEvent};
use crate::bridge::BridgeError;

/// Height-addressed chain that yields events in `(height, index)` order
#[async_trait]
pub trait BlockSource: Send + Sync {
    type Event: ScannedEvent;

    fn chain(&self) -> ChainKind;

    async fn latest_height(&self) -> Result<u64, ScannerError>;

    /// Events of `height` whose index is `>= from_index`, in index order
    async fn scan_block(
        &self,
        height: u64,
        from_index: u32,
    ) -> Result<ScannedBlock<Self::Event>, ScannerError>;
}

/// Result of scanning a single block
#[derive(Debug, Clone)]
pub struct ScannedBlock<E> {
    pub height: u64,
    pub hash: String,
    pub timestamp: i64,
    pub events: Vec<E>,
}

/// Position and idempotency key of a scanned event
pub trait ScannedEvent: Send + Sync {
    fn height(&self) -> u64;

    fn index(&self) -> u32;

    fn key(&self) -> &str;
}

impl ScannedEvent for TransferEvent {
    fn height(&self) -> u64 {
        self.block_height
    }

    fn index(&self) -> u32 {
        self.tx_index
    }

    fn key(&self) -> &str {
        &self.tx_id
    }
}

impl ScannedEvent for SettlementLedgerEntry {
    fn height(&self) -> u64 {
        self.height
    }

    fn index(&self) -> u32 {
        self.bridge_module_tx_index
    }

    fn key(&self) -> &str {
        &self.bridge_event_id
    }
}

/// Durable destination of scanned events.
///
/// `persist` writes the event and `cursor` atomically and returns `Ok(false)`
/// when the event was already recorded.
#[async_trait]
pub trait EventSink<E>: Send + Sync {
    async fn persist(&self, event: &E, cursor: &IndexCursor) -> Result<bool, BridgeError>;
}

#[async_trait]
impl<S: DepositStore> EventSink<TransferEvent> for S {
    async fn persist(
        &self,
        event: &TransferEvent,
        cursor: &IndexCursor,
    ) -> Result<bool, BridgeError> {
        self.insert_deposit_with_cursor(event, cursor).await
    }
}

#[async_trait]
impl<S: LedgerStore> EventSink<SettlementLedgerEntry> for S {
    async fn persist(
        &self,
        event: &SettlementLedgerEntry,
        cursor: &IndexCursor,
    ) -> Result<bool, BridgeError> {
        self.insert_ledger_entry_with_cursor(event, cursor).await
    }
}
