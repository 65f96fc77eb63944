//! Bitcoin sender to rollup account resolution

use alloy_primitives::{Address, keccak256};
use async_trait::async_trait;
use bitcoincore_rpc::bitcoin::secp256k1::PublicKey;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::error::ChainError;
use crate::config::AddressServiceConfig;

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Rollup account that receives deposits from `btc_address`
    async fn resolve(&self, btc_address: &str) -> Result<Address, ChainError>;
}

/// EVM address of a secp256k1 public key (compressed or uncompressed)
pub fn evm_address_from_pubkey(pubkey_hex: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(pubkey_hex.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = PublicKey::from_slice(&bytes)
        .map_err(|e| ChainError::Decode(format!("invalid pubkey: {}", e)))?;
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    Ok(Address::from_slice(&hash[12..]))
}

#[derive(Deserialize)]
struct PubkeyResponse {
    code: String,
    #[serde(default)]
    message: String,
    data: Option<PubkeyData>,
}

#[derive(Deserialize)]
struct PubkeyData {
    pubkey: String,
}

/// Looks up the sender's public key from the address service
pub struct HttpAddressResolver {
    url: String,
    client: reqwest::Client,
}

impl HttpAddressResolver {
    pub fn new(config: &AddressServiceConfig) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
    async fn resolve(&self, btc_address: &str) -> Result<Address, ChainError> {
        let url = format!("{}/{}", self.url, btc_address);
        let response: PubkeyResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.code != "0" {
            return Err(ChainError::NotFound(format!(
                "no pubkey for {}: {} {}",
                btc_address, response.code, response.message
            )));
        }
        let data = response
            .data
            .ok_or_else(|| ChainError::Decode("pubkey response without data".into()))?;

        let address = evm_address_from_pubkey(&data.pubkey)?;
        debug!(btc_address, evm_address = %address, "Resolved rollup account");
        Ok(address)
    }
}
