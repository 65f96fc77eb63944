//! Rollup-side deposit execution: bridge mint and direct fallback transfer
//!
//! Transactions are legacy EIP-155 transactions signed locally. Gas estimation
//! runs first, so contract reverts surface as classified `ChainError` kinds
//! before anything is signed.

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, sol};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::ChainError;
use super::rollup::{CallRequest, RollupRpc};
use crate::config::WaitPolicy;

sol! {
    function depositV4(bytes32 txHash, address to, uint256 amount);
}

/// 1 sat = 10^10 wei on the rollup
pub const SATS_TO_WEI: u64 = 10_000_000_000;

/// A signed transaction that has not necessarily been broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub hash: B256,
    pub raw: Bytes,
}

/// Final status of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinedStatus {
    Success,
    Reverted,
}

#[async_trait]
pub trait RollupMinter: Send + Sync {
    /// Invoke the bridge mint keyed by the source tx hash and return the rollup tx hash
    async fn mint(&self, btc_tx_hash: &str, to: Address, amount_sats: u64)
    -> Result<B256, ChainError>;

    /// Sign a direct value transfer of `amount_sats * 10^10` wei without sending it
    async fn prepare_transfer(
        &self,
        to: Address,
        amount_sats: u64,
    ) -> Result<SignedTransfer, ChainError>;

    /// Broadcast previously signed bytes; re-sending a known or mined
    /// transaction is not an error.
    ///
    /// `NonceTooLow` means another transaction took the nonce and these bytes
    /// can never be mined.
    async fn broadcast(&self, raw: &[u8]) -> Result<B256, ChainError>;

    /// Poll for inclusion until `policy.timeout`, which yields `ChainError::Timeout`
    async fn wait_mined(&self, tx_hash: B256, policy: &WaitPolicy)
    -> Result<MinedStatus, ChainError>;
}

/// Source tx hashes are 64 hex characters in display order
pub fn btc_hash_to_bytes32(btc_tx_hash: &str) -> Result<B256, ChainError> {
    let bytes = hex::decode(btc_tx_hash.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("invalid tx hash {}: {}", btc_tx_hash, e)))?;
    if bytes.len() != 32 {
        return Err(ChainError::Decode(format!(
            "tx hash {} is {} bytes, expected 32",
            btc_tx_hash,
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

pub fn sats_to_wei(amount_sats: u64) -> U256 {
    U256::from(amount_sats) * U256::from(SATS_TO_WEI)
}

pub struct EvmMinter {
    rpc: Arc<dyn RollupRpc>,
    signer: PrivateKeySigner,
    bridge_contract: Address,
    chain_id: u64,
    gas_price_multiple: u64,
}

impl EvmMinter {
    pub fn new(
        rpc: Arc<dyn RollupRpc>,
        private_key: &str,
        bridge_contract: Address,
        chain_id: u64,
        gas_price_multiple: u64,
    ) -> Result<Self, ChainError> {
        let signer: PrivateKeySigner = private_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| ChainError::Decode(format!("invalid rollup private key: {}", e)))?;

        info!(
            minter = %signer.address(),
            contract = %bridge_contract,
            chain_id,
            "Rollup minter ready"
        );

        Ok(Self {
            rpc,
            signer,
            bridge_contract,
            chain_id,
            gas_price_multiple,
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign(&self, to: Address, value: U256, input: Bytes) -> Result<SignedTransfer, ChainError> {
        let call = CallRequest {
            from: self.address(),
            to,
            value,
            input: input.clone(),
        };
        let gas = self.rpc.estimate_gas(&call).await?;
        let nonce = self.rpc.pending_nonce(self.address()).await?;
        let mut gas_price = self.rpc.gas_price().await?;
        if self.gas_price_multiple > 1 {
            gas_price = gas_price.saturating_mul(self.gas_price_multiple as u128);
        }

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price,
            gas_limit: gas.saturating_mul(2),
            to: TxKind::Call(to),
            value,
            input,
        };

        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| ChainError::Decode(format!("signing failed: {}", e)))?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        debug!(tx_hash = %hash, nonce, gas_price, gas, "Signed rollup transaction");
        Ok(SignedTransfer {
            hash,
            raw: raw.into(),
        })
    }
}

#[async_trait]
impl RollupMinter for EvmMinter {
    async fn mint(
        &self,
        btc_tx_hash: &str,
        to: Address,
        amount_sats: u64,
    ) -> Result<B256, ChainError> {
        let input = depositV4Call {
            txHash: btc_hash_to_bytes32(btc_tx_hash)?,
            to,
            amount: U256::from(amount_sats),
        }
        .abi_encode();

        let signed = self
            .sign(self.bridge_contract, U256::ZERO, input.into())
            .await?;
        self.broadcast(&signed.raw).await
    }

    async fn prepare_transfer(
        &self,
        to: Address,
        amount_sats: u64,
    ) -> Result<SignedTransfer, ChainError> {
        self.sign(to, sats_to_wei(amount_sats), Bytes::new()).await
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, ChainError> {
        match self.rpc.send_raw_transaction(raw).await {
            Ok(hash) => Ok(hash),
            Err(ChainError::AlreadyKnown) => {
                let hash = keccak256(raw);
                debug!(tx_hash = %hash, "Transaction already known to the node");
                Ok(hash)
            }
            Err(ChainError::NonceTooLow) => {
                let hash = keccak256(raw);
                if self.rpc.transaction_receipt(hash).await?.is_some() {
                    debug!(tx_hash = %hash, "Transaction already mined");
                    return Ok(hash);
                }
                warn!(tx_hash = %hash, "Nonce taken by another transaction");
                Err(ChainError::NonceTooLow)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_mined(
        &self,
        tx_hash: B256,
        policy: &WaitPolicy,
    ) -> Result<MinedStatus, ChainError> {
        let poll = async {
            loop {
                match self.rpc.transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        return if receipt.is_success() {
                            MinedStatus::Success
                        } else {
                            MinedStatus::Reverted
                        };
                    }
                    Ok(None) => {}
                    Err(e) => warn!(tx_hash = %tx_hash, error = %e, "Receipt poll failed"),
                }
                tokio::time::sleep(policy.poll_interval).await;
            }
        };

        tokio::time::timeout(policy.timeout, poll)
            .await
            .map_err(|_| {
                ChainError::Timeout(format!(
                    "{} not mined within {:?}",
                    tx_hash, policy.timeout
                ))
            })
    }
}
