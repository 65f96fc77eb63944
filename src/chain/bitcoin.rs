//! Bitcoin node access
//!
//! `bitcoincore-rpc` is a blocking client; every call runs on the blocking
//! thread pool so scan loops never stall the runtime.

use async_trait::async_trait;
use bitcoincore_rpc::bitcoin::{Block, BlockHash, Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use std::sync::Arc;
use tracing::info;

use super::error::ChainError;
use crate::config::BitcoinConfig;

/// Verbose block metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: u64,
    pub confirmations: i64,
    /// Block header time, unix seconds
    pub time: u64,
}

/// Read-only capabilities of a Bitcoin-compatible node
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    async fn block_count(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError>;

    async fn block_info(&self, hash: &BlockHash) -> Result<BlockInfo, ChainError>;

    async fn block(&self, hash: &BlockHash) -> Result<Block, ChainError>;

    async fn raw_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    /// Confirmation depth of a transaction; 0 while in the mempool
    async fn transaction_confirmations(&self, txid: &Txid) -> Result<u32, ChainError>;
}

/// bitcoind JSON-RPC client
pub struct BitcoinCoreClient {
    client: Arc<Client>,
}

impl BitcoinCoreClient {
    pub fn new(config: &BitcoinConfig) -> Result<Self, ChainError> {
        info!(
            "Initializing bitcoin RPC client for {} network at {}",
            config.network, config.rpc_url
        );
        let client = Client::new(
            &config.rpc_url,
            Auth::UserPass(config.rpc_user.clone(), config.rpc_password.clone()),
        )?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, bitcoincore_rpc::Error> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| ChainError::Transport(format!("bitcoin RPC task failed: {}", e)))?
            .map_err(ChainError::from)
    }
}

#[async_trait]
impl BitcoinRpc for BitcoinCoreClient {
    async fn block_count(&self) -> Result<u64, ChainError> {
        self.call(|c| c.get_block_count()).await
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError> {
        self.call(move |c| c.get_block_hash(height)).await
    }

    async fn block_info(&self, hash: &BlockHash) -> Result<BlockInfo, ChainError> {
        let hash = *hash;
        let info = self.call(move |c| c.get_block_info(&hash)).await?;
        Ok(BlockInfo {
            hash: info.hash,
            height: info.height as u64,
            confirmations: info.confirmations as i64,
            time: info.time as u64,
        })
    }

    async fn block(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        let hash = *hash;
        self.call(move |c| c.get_block(&hash)).await
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let txid = *txid;
        self.call(move |c| c.get_raw_transaction(&txid, None)).await
    }

    async fn transaction_confirmations(&self, txid: &Txid) -> Result<u32, ChainError> {
        let txid = *txid;
        let info = self
            .call(move |c| c.get_raw_transaction_info(&txid, None))
            .await?;
        Ok(info.confirmations.unwrap_or(0))
    }
}
