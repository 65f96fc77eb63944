//! Cursor Worker - resumable scanning loop
//!
//! Drives one `BlockSource` from its stored cursor to the chain tip. Each event
//! is persisted together with the cursor that covers it, so a restart resumes
//! right after the last recorded event and never records one twice.

use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::ScannerError;
use super::scanner::{BlockSource, EventSink, ScannedEvent};
use crate::bridge::store::CursorStore;
use crate::bridge::types::IndexCursor;
use crate::bridge::BridgeError;
use crate::config::ScanPolicy;

/// Result of one pass over the chain
#[derive(Debug)]
pub enum ScanOutcome {
    /// Nothing left to scan below the tip (or the next block is too shallow)
    CaughtUp { height: u64 },
    /// Heights up to `height` are fully processed
    Advanced { height: u64, events: usize },
    /// The pass stopped early; the stored cursor is the resume point
    Stalled(ScannerError),
}

pub struct CursorWorker<S, K> {
    source: S,
    store: Arc<K>,
    policy: ScanPolicy,
}

impl<S, K> CursorWorker<S, K>
where
    S: BlockSource,
    K: CursorStore + EventSink<S::Event>,
{
    pub fn new(source: S, store: Arc<K>, policy: ScanPolicy) -> Self {
        Self {
            source,
            store,
            policy,
        }
    }

    pub async fn run(&self) {
        info!(
            chain = %self.source.chain(),
            "Scanner starting, new block wait {:?}",
            self.policy.new_block_wait
        );

        loop {
            match self.scan_once().await {
                ScanOutcome::CaughtUp { height } => {
                    debug!(chain = %self.source.chain(), height, "Caught up");
                    sleep(self.policy.new_block_wait).await;
                }
                ScanOutcome::Advanced { height, events } => {
                    debug!(chain = %self.source.chain(), height, events, "Advanced");
                }
                ScanOutcome::Stalled(e) => {
                    error!(chain = %self.source.chain(), "Scan stalled: {}", e);
                    sleep(self.policy.block_interval).await;
                }
            }
        }
    }

    /// Scan from the stored cursor up to the current tip
    pub async fn scan_once(&self) -> ScanOutcome {
        match self.scan_range().await {
            Ok(outcome) => outcome,
            Err(e) => ScanOutcome::Stalled(e),
        }
    }

    async fn scan_range(&self) -> Result<ScanOutcome, ScannerError> {
        let chain = self.source.chain();

        let Some(cursor) = self.store.load_cursor(chain).await? else {
            let latest = self.source.latest_height().await?;
            info!(%chain, height = latest, "No cursor stored, starting at chain tip");
            self.store
                .save_cursor(&IndexCursor::block_done(chain, latest))
                .await?;
            return Ok(ScanOutcome::CaughtUp { height: latest });
        };

        let latest = self.source.latest_height().await?;
        let (start, mut from_index) = cursor.next_position();
        if start > latest {
            return Ok(ScanOutcome::CaughtUp { height: cursor.height });
        }

        let mut recorded = 0usize;
        for height in start..=latest {
            let block = match self.source.scan_block(height, from_index).await {
                Ok(block) => block,
                Err(e) if e.is_waiting() => {
                    debug!(%chain, height, "{}", e);
                    return Ok(ScanOutcome::CaughtUp {
                        height: height.saturating_sub(1),
                    });
                }
                Err(e) => return Err(e),
            };
            from_index = 0;

            for event in &block.events {
                let position = IndexCursor::after_tx(chain, height, event.index());
                if self.persist(event, &position).await? {
                    recorded += 1;
                }
                if !self.policy.tx_interval.is_zero() {
                    sleep(self.policy.tx_interval).await;
                }
            }

            self.store
                .save_cursor(&IndexCursor::block_done(chain, height))
                .await?;
            if !block.events.is_empty() {
                info!(%chain, height, hash = %block.hash, events = block.events.len(), "Scanned block");
            }
            if !self.policy.block_interval.is_zero() {
                sleep(self.policy.block_interval).await;
            }
        }

        Ok(ScanOutcome::Advanced {
            height: latest,
            events: recorded,
        })
    }

    /// Record one event; an already recorded event only moves the cursor
    async fn persist(
        &self,
        event: &S::Event,
        position: &IndexCursor,
    ) -> Result<bool, ScannerError> {
        match self.store.persist(event, position).await {
            Ok(true) => {
                debug!(chain = %position.chain, key = event.key(), height = event.height(), "Event recorded");
                Ok(true)
            }
            Ok(false) | Err(BridgeError::Duplicate(_)) => {
                warn!(chain = %position.chain, key = event.key(), "Event already recorded");
                self.store.save_cursor(position).await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::memory::MemoryStore;
    use crate::bridge::store::DepositStore;
    use crate::bridge::types::{ChainKind, Direction, TransferEvent};
    use crate::chain::ChainError;
    use crate::sentinel::scanner::ScannedBlock;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Chain whose blocks carry a fixed number of deposits at tx index 1..=n
    #[derive(Default)]
    struct ScriptedChain {
        blocks: Mutex<BTreeMap<u64, u32>>,
        shallow_from: Mutex<Option<u64>>,
        fail_height: Mutex<Option<u64>>,
        scans: AtomicUsize,
    }

    impl ScriptedChain {
        fn with_blocks(counts: &[u32]) -> Self {
            let chain = Self::default();
            for (i, n) in counts.iter().enumerate() {
                chain.blocks.lock().unwrap().insert(i as u64 + 1, *n);
            }
            chain
        }

        fn event(height: u64, tx_index: u32) -> TransferEvent {
            TransferEvent {
                tx_id: format!("{:04}{:04}", height, tx_index),
                block_height: height,
                tx_index,
                from_addresses: vec!["bcrt1qsender".to_string()],
                to_address: "bcrt1qcustody".to_string(),
                amount: 1_000,
                direction: Direction::Deposit,
                block_time: 1_700_000_000,
            }
        }
    }

    #[async_trait]
    impl BlockSource for Arc<ScriptedChain> {
        type Event = TransferEvent;

        fn chain(&self) -> ChainKind {
            ChainKind::Bitcoin
        }

        async fn latest_height(&self) -> Result<u64, ScannerError> {
            Ok(self.blocks.lock().unwrap().keys().last().copied().unwrap_or(0))
        }

        async fn scan_block(
            &self,
            height: u64,
            from_index: u32,
        ) -> Result<ScannedBlock<TransferEvent>, ScannerError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            if *self.fail_height.lock().unwrap() == Some(height) {
                return Err(ChainError::Transport("connection reset".into()).into());
            }
            if self.shallow_from.lock().unwrap().is_some_and(|h| height >= h) {
                return Err(ChainError::InsufficientConfirmations {
                    height,
                    confirmations: 0,
                    required: 1,
                }
                .into());
            }
            let count = self.blocks.lock().unwrap().get(&height).copied().unwrap_or(0);
            Ok(ScannedBlock {
                height,
                hash: format!("hash-{}", height),
                timestamp: 1_700_000_000,
                events: (1..=count)
                    .filter(|i| *i >= from_index)
                    .map(|i| ScriptedChain::event(height, i))
                    .collect(),
            })
        }
    }

    fn policy() -> ScanPolicy {
        ScanPolicy {
            new_block_wait: Duration::from_secs(60),
            block_interval: Duration::ZERO,
            tx_interval: Duration::ZERO,
        }
    }

    fn worker(
        chain: &Arc<ScriptedChain>,
        store: &Arc<MemoryStore>,
    ) -> CursorWorker<Arc<ScriptedChain>, MemoryStore> {
        CursorWorker::new(chain.clone(), store.clone(), policy())
    }

    async fn seeded_store(height: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .save_cursor(&IndexCursor::block_done(ChainKind::Bitcoin, height))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_first_run_starts_at_tip() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[2, 1, 3]));
        let store = Arc::new(MemoryStore::new());

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(outcome, ScanOutcome::CaughtUp { height: 3 }));
        assert_eq!(
            store.cursor(ChainKind::Bitcoin),
            Some(IndexCursor::block_done(ChainKind::Bitcoin, 3))
        );
        assert!(store.deposits().is_empty());
        assert_eq!(chain.scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scans_every_block_and_event() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[2, 0, 3]));
        let store = seeded_store(0).await;

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(
            outcome,
            ScanOutcome::Advanced {
                height: 3,
                events: 5
            }
        ));
        assert_eq!(store.deposits().len(), 5);
        assert_eq!(
            store.cursor(ChainKind::Bitcoin),
            Some(IndexCursor::block_done(ChainKind::Bitcoin, 3))
        );

        // Nothing new on the next pass
        let outcome = worker(&chain, &store).scan_once().await;
        assert!(matches!(outcome, ScanOutcome::CaughtUp { height: 3 }));
    }

    #[tokio::test]
    async fn test_resumes_after_last_recorded_event() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[3]));
        let store = Arc::new(MemoryStore::new());
        store
            .save_cursor(&IndexCursor::after_tx(ChainKind::Bitcoin, 1, 2))
            .await
            .unwrap();

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(outcome, ScanOutcome::Advanced { events: 1, .. }));
        let deposits = store.deposits();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].btc_tx_index, 3);
    }

    #[tokio::test]
    async fn test_failed_write_stalls_without_losing_events() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[3]));
        let store = seeded_store(0).await;
        let worker = worker(&chain, &store);

        store.fail_next_write(BridgeError::Database("connection closed".into()));
        assert!(matches!(worker.scan_once().await, ScanOutcome::Stalled(_)));
        assert!(store.deposits().is_empty());

        assert!(matches!(
            worker.scan_once().await,
            ScanOutcome::Advanced { events: 3, .. }
        ));
        assert_eq!(store.deposits().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_advances_cursor() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[2]));
        let store = seeded_store(0).await;
        store
            .insert_deposit_with_cursor(
                &ScriptedChain::event(1, 1),
                &IndexCursor::after_tx(ChainKind::Bitcoin, 0, 0),
            )
            .await
            .unwrap();

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(outcome, ScanOutcome::Advanced { events: 1, .. }));
        assert_eq!(store.deposits().len(), 2);
        assert!(
            store
                .cursor_history()
                .contains(&IndexCursor::after_tx(ChainKind::Bitcoin, 1, 1))
        );
    }

    #[tokio::test]
    async fn test_shallow_block_means_caught_up() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[1, 1, 1]));
        *chain.shallow_from.lock().unwrap() = Some(3);
        let store = seeded_store(0).await;

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(outcome, ScanOutcome::CaughtUp { height: 2 }));
        assert_eq!(store.deposits().len(), 2);
        assert_eq!(
            store.cursor(ChainKind::Bitcoin),
            Some(IndexCursor::block_done(ChainKind::Bitcoin, 2))
        );
    }

    #[tokio::test]
    async fn test_chain_error_keeps_cursor_at_last_good_height() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[1, 1, 1]));
        *chain.fail_height.lock().unwrap() = Some(2);
        let store = seeded_store(0).await;

        let outcome = worker(&chain, &store).scan_once().await;

        assert!(matches!(
            outcome,
            ScanOutcome::Stalled(ScannerError::Chain(ChainError::Transport(_)))
        ));
        assert_eq!(
            store.cursor(ChainKind::Bitcoin),
            Some(IndexCursor::block_done(ChainKind::Bitcoin, 1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_for_new_blocks() {
        let chain = Arc::new(ScriptedChain::with_blocks(&[1]));
        let store = seeded_store(0).await;
        let worker = Arc::new(worker(&chain, &store));

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.deposits().len(), 1);

        chain.blocks.lock().unwrap().insert(2, 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.deposits().len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.deposits().len(), 3);

        handle.abort();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_cursor_monotonic_and_events_recorded_once(
            counts in prop::collection::vec(0u32..4, 1..6),
            failures in prop::collection::vec(any::<bool>(), 0..12),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let chain = Arc::new(ScriptedChain::with_blocks(&counts));
                let store = seeded_store(0).await;
                let worker = worker(&chain, &store);
                let tip = counts.len() as u64;

                for fail in &failures {
                    if *fail {
                        store.fail_next_write(BridgeError::Database("injected".into()));
                    }
                    worker.scan_once().await;
                }
                for _ in 0..4 {
                    worker.scan_once().await;
                }

                let history = store.cursor_history();
                for pair in history.windows(2) {
                    prop_assert!(pair[0].key() < pair[1].key());
                }
                prop_assert_eq!(
                    store.cursor(ChainKind::Bitcoin),
                    Some(IndexCursor::block_done(ChainKind::Bitcoin, tip))
                );

                let expected: u32 = counts.iter().sum();
                let deposits = store.deposits();
                prop_assert_eq!(deposits.len(), expected as usize);
                let unique: HashSet<_> = deposits.iter().map(|d| d.btc_tx_hash.clone()).collect();
                prop_assert_eq!(unique.len(), deposits.len());
                Ok(())
            })?;
        }
    }
}
