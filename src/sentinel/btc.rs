//! BTC Scanner Implementation
//!
//! Turns confirmed blocks into deposit events for payments to the custody
//! address. UTXO transactions carry no sender field, so senders are rebuilt
//! from the outputs the inputs spend.

use async_trait::async_trait;
use bitcoincore_rpc::bitcoin::{Address, Network, Transaction, TxOut};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::ScannerError;
use super::scanner::{BlockSource, ScannedBlock};
use crate::bridge::types::{ChainKind, Direction, TransferEvent};
use crate::chain::{BitcoinRpc, BlockInfo, ChainError};
use crate::config::BitcoinConfig;

pub struct BitcoinChainScanner {
    rpc: Arc<dyn BitcoinRpc>,
    network: Network,
    custody_address: String,
    block_confirmations: u32,
}

impl BitcoinChainScanner {
    pub fn new(rpc: Arc<dyn BitcoinRpc>, config: &BitcoinConfig) -> Result<Self, ScannerError> {
        let network = Network::from_str(&config.network)
            .map_err(|e| ScannerError::Config(format!("bitcoin.network: {}", e)))?;

        info!(
            "Initializing BTC scanner on {} for custody address {} ({} confirmations)",
            network, config.custody_address, config.block_confirmations
        );

        Ok(Self {
            rpc,
            network,
            custody_address: config.custody_address.clone(),
            block_confirmations: config.block_confirmations,
        })
    }

    /// Deposit events of `height` starting at `from_tx_index`.
    ///
    /// Fails with `InsufficientConfirmations` while the block is shallower than
    /// the configured depth.
    pub async fn parse_block(
        &self,
        height: u64,
        from_tx_index: u32,
    ) -> Result<(Vec<TransferEvent>, BlockInfo), ScannerError> {
        let hash = self.rpc.block_hash(height).await?;
        let info = self.rpc.block_info(&hash).await?;
        if info.confirmations < self.block_confirmations as i64 {
            return Err(ChainError::InsufficientConfirmations {
                height,
                confirmations: info.confirmations,
                required: self.block_confirmations,
            }
            .into());
        }

        let block = self.rpc.block(&hash).await?;
        let mut events = Vec::new();
        for (index, tx) in block
            .txdata
            .iter()
            .enumerate()
            .skip(from_tx_index as usize)
        {
            if let Some(event) = self.parse_tx(height, index as u32, tx, info.time).await? {
                events.push(event);
            }
        }

        debug!(height, from_tx_index, events = events.len(), "Parsed block");
        Ok((events, info))
    }

    async fn parse_tx(
        &self,
        height: u64,
        tx_index: u32,
        tx: &Transaction,
        block_time: u64,
    ) -> Result<Option<TransferEvent>, ScannerError> {
        let mut amount = 0u64;
        let mut pays_custody = false;
        for output in &tx.output {
            if output.script_pubkey.is_op_return() {
                continue;
            }
            let Some(address) = self.decode_address(output) else {
                continue;
            };
            if address == self.custody_address {
                pays_custody = true;
                amount += output.value.to_sat();
            }
        }
        if !pays_custody {
            return Ok(None);
        }

        let txid = tx.compute_txid().to_string();
        if tx.is_coinbase() {
            warn!(%txid, height, "Coinbase pays custody address, no sender to credit");
            return Ok(None);
        }

        let from_addresses = self.resolve_senders(tx).await?;
        if from_addresses.is_empty() {
            warn!(%txid, height, "Deposit discarded: no sender address could be resolved");
            return Ok(None);
        }
        if from_addresses.contains(&self.custody_address) {
            debug!(%txid, height, "Skipping custody self-transfer");
            return Ok(None);
        }

        info!(%txid, height, tx_index, amount, from = %from_addresses[0], "Deposit detected");
        Ok(Some(TransferEvent {
            tx_id: txid,
            block_height: height,
            tx_index,
            from_addresses,
            to_address: self.custody_address.clone(),
            amount,
            direction: Direction::Deposit,
            block_time: block_time as i64,
        }))
    }

    /// Distinct addresses of the outputs spent by `tx`, in input order
    async fn resolve_senders(&self, tx: &Transaction) -> Result<Vec<String>, ScannerError> {
        let mut senders: Vec<String> = Vec::new();
        for input in &tx.input {
            let outpoint = input.previous_output;
            let prev = self.rpc.raw_transaction(&outpoint.txid).await?;
            let Some(spent) = prev.output.get(outpoint.vout as usize) else {
                warn!(%outpoint, "Input references a missing output");
                continue;
            };
            match self.decode_address(spent) {
                Some(address) if !senders.contains(&address) => senders.push(address),
                Some(_) => {}
                None => debug!(%outpoint, "Skipping input with unsupported script"),
            }
        }
        Ok(senders)
    }

    fn decode_address(&self, output: &TxOut) -> Option<String> {
        Address::from_script(&output.script_pubkey, self.network)
            .ok()
            .map(|a| a.to_string())
    }
}

#[async_trait]
impl BlockSource for BitcoinChainScanner {
    type Event = TransferEvent;

    fn chain(&self) -> ChainKind {
        ChainKind::Bitcoin
    }

    async fn latest_height(&self) -> Result<u64, ScannerError> {
        Ok(self.rpc.block_count().await?)
    }

    async fn scan_block(
        &self,
        height: u64,
        from_index: u32,
    ) -> Result<ScannedBlock<TransferEvent>, ScannerError> {
        let (events, info) = self.parse_block(height, from_index).await?;
        Ok(ScannedBlock {
            height,
            hash: info.hash.to_string(),
            timestamp: info.time as i64,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::bitcoin::fake::{FakeBitcoin, address, block, coinbase, script, tx};
    use bitcoincore_rpc::bitcoin::{OutPoint, ScriptBuf};

    const CUSTODY: u8 = 0xcc;
    const ALICE: u8 = 0xa1;
    const BOB: u8 = 0xb0;

    fn config(confirmations: u32) -> BitcoinConfig {
        BitcoinConfig {
            rpc_url: "http://127.0.0.1:18443".to_string(),
            rpc_user: "user".to_string(),
            rpc_password: "pass".to_string(),
            network: "regtest".to_string(),
            custody_address: address(CUSTODY),
            block_confirmations: confirmations,
            withdraw_confirmations: 6,
        }
    }

    fn scanner(rpc: Arc<FakeBitcoin>, confirmations: u32) -> BitcoinChainScanner {
        BitcoinChainScanner::new(rpc, &config(confirmations)).unwrap()
    }

    /// A funding tx paying `sats` to `owner`, registered as a previous output
    fn funding(rpc: &FakeBitcoin, owner: u8, sats: u64) -> OutPoint {
        let txid = rpc.add_tx(coinbase(script(owner), sats));
        OutPoint { txid, vout: 0 }
    }

    #[tokio::test]
    async fn test_deposit_detected_with_sender_and_amount() {
        let rpc = Arc::new(FakeBitcoin::default());
        let input = funding(&rpc, ALICE, 50);
        let deposit = tx(
            vec![input],
            vec![(script(CUSTODY), 11), (script(ALICE), 30)],
        );
        let txid = deposit.compute_txid().to_string();
        rpc.push_block(
            100,
            block(1_700_000_000, vec![coinbase(script(BOB), 5_000), deposit]),
        );

        let (events, info) = scanner(rpc, 1).parse_block(100, 0).await.unwrap();

        assert_eq!(info.height, 100);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.tx_id, txid);
        assert_eq!(event.tx_index, 1);
        assert_eq!(event.amount, 11);
        assert_eq!(event.from_addresses, vec![address(ALICE)]);
        assert_eq!(event.to_address, address(CUSTODY));
        assert_eq!(event.block_time, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_amount_aggregated_across_custody_outputs() {
        let rpc = Arc::new(FakeBitcoin::default());
        let input = funding(&rpc, ALICE, 100);
        let deposit = tx(
            vec![input],
            vec![(script(CUSTODY), 10), (script(CUSTODY), 15)],
        );
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), deposit]));

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert_eq!(events[0].amount, 25);
    }

    #[tokio::test]
    async fn test_all_senders_aggregated() {
        let rpc = Arc::new(FakeBitcoin::default());
        let a = funding(&rpc, ALICE, 10);
        let b = funding(&rpc, BOB, 10);
        let a2 = funding(&rpc, ALICE, 10);
        let deposit = tx(vec![a, b, a2], vec![(script(CUSTODY), 30)]);
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), deposit]));

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert_eq!(events[0].from_addresses, vec![address(ALICE), address(BOB)]);
    }

    #[tokio::test]
    async fn test_unresolvable_senders_discard_transaction() {
        let rpc = Arc::new(FakeBitcoin::default());
        // bare OP_TRUE output has no address
        let txid = rpc.add_tx(coinbase(ScriptBuf::from_bytes(vec![0x51]), 10));
        let deposit = tx(
            vec![OutPoint { txid, vout: 0 }],
            vec![(script(CUSTODY), 10)],
        );
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), deposit]));

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_skips_op_return_undecodable_and_unrelated_outputs() {
        let rpc = Arc::new(FakeBitcoin::default());
        let input = funding(&rpc, ALICE, 10);
        let unrelated = tx(vec![funding(&rpc, ALICE, 10)], vec![(script(BOB), 9)]);
        let deposit = tx(
            vec![input],
            vec![
                (ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]), 0),
                (ScriptBuf::from_bytes(vec![0x51]), 1),
                (script(CUSTODY), 8),
            ],
        );
        rpc.push_block(
            7,
            block(0, vec![coinbase(script(BOB), 1), unrelated, deposit]),
        );

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_index, 2);
        assert_eq!(events[0].amount, 8);
    }

    #[tokio::test]
    async fn test_self_transfer_ignored() {
        let rpc = Arc::new(FakeBitcoin::default());
        let input = funding(&rpc, CUSTODY, 100);
        let consolidation = tx(vec![input], vec![(script(CUSTODY), 99)]);
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), consolidation]));

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_coinbase_to_custody_ignored() {
        let rpc = Arc::new(FakeBitcoin::default());
        rpc.push_block(7, block(0, vec![coinbase(script(CUSTODY), 5_000)]));

        let (events, _) = scanner(rpc, 1).parse_block(7, 0).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_resume_from_tx_index() {
        let rpc = Arc::new(FakeBitcoin::default());
        let first = tx(vec![funding(&rpc, ALICE, 10)], vec![(script(CUSTODY), 1)]);
        let second = tx(vec![funding(&rpc, BOB, 10)], vec![(script(CUSTODY), 2)]);
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), first, second]));

        let (events, _) = scanner(rpc.clone(), 1).parse_block(7, 2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 2);
    }

    #[tokio::test]
    async fn test_insufficient_confirmations() {
        let rpc = Arc::new(FakeBitcoin::default());
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1)]));
        rpc.push_block(8, block(1, vec![coinbase(script(BOB), 1)]));

        let scanner = scanner(rpc, 3);
        let err = scanner.parse_block(7, 0).await.unwrap_err();
        assert!(err.is_waiting());
        assert!(matches!(
            err,
            ScannerError::Chain(ChainError::InsufficientConfirmations {
                height: 7,
                confirmations: 2,
                required: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_previous_transaction_is_an_error() {
        let rpc = Arc::new(FakeBitcoin::default());
        let dangling = OutPoint {
            txid: coinbase(script(ALICE), 777).compute_txid(),
            vout: 0,
        };
        let deposit = tx(vec![dangling], vec![(script(CUSTODY), 10)]);
        rpc.push_block(7, block(0, vec![coinbase(script(BOB), 1), deposit]));

        let result = scanner(rpc, 1).parse_block(7, 0).await;
        assert!(matches!(
            result,
            Err(ScannerError::Chain(ChainError::NotFound(_)))
        ));
    }

    #[test]
    fn test_invalid_network_rejected() {
        let mut config = config(1);
        config.network = "moonnet".to_string();
        let rpc: Arc<dyn BitcoinRpc> = Arc::new(FakeBitcoin::default());
        assert!(matches!(
            BitcoinChainScanner::new(rpc, &config),
            Err(ScannerError::Config(_))
        ));
    }
}
