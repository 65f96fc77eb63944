//! Settlement ledger access
//!
//! Reads go to the Cosmos REST API. Writes go through a signing gateway that
//! owns the ledger account and answers with the ABCI result of the broadcast.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::error::ChainError;
use crate::config::SettlementConfig;

/// ABCI codes registered by the bridge module
pub mod codes {
    pub const OK: u32 = 0;
    pub const INDEX_EXISTS: u32 = 2;
    pub const INDEX_NOT_EXISTS: u32 = 3;
    pub const INVALID_STATUS: u32 = 4;
    pub const NOT_CALLER_GROUP_MEMBERS: u32 = 5;
}

/// Map a non-zero bridge-module code to its error kind
pub fn classify_code(code: u32, raw_log: &str) -> ChainError {
    match code {
        codes::INDEX_EXISTS => ChainError::IndexExists,
        codes::INDEX_NOT_EXISTS => ChainError::IndexNotExists,
        codes::INVALID_STATUS => ChainError::InvalidStatus,
        codes::NOT_CALLER_GROUP_MEMBERS => ChainError::NotAuthorized,
        other => ChainError::Rpc {
            code: other as i64,
            message: raw_log.to_string(),
        },
    }
}

/// One transaction of a ledger block
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTx {
    pub tx_hash: String,
    pub code: u32,
    pub raw_log: String,
    pub data: String,
    pub messages: Vec<serde_json::Value>,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LedgerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<LedgerAttribute>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LedgerAttribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl LedgerTx {
    /// `@type` of every message
    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter_map(|m| m.get("@type").and_then(|t| t.as_str()))
    }

    /// First attribute value with `key` across all events
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.events
            .iter()
            .flat_map(|e| e.attributes.iter())
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum LedgerDepositStatus {
    #[serde(rename = "DEPOSIT_STATUS_PENDING")]
    Pending,
    #[serde(rename = "DEPOSIT_STATUS_COMPLETED")]
    Completed,
    #[serde(other)]
    Unknown,
}

/// Deposit entry as stored by the bridge module
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LedgerDeposit {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    #[serde(with = "string_i64")]
    pub value: i64,
    pub status: LedgerDepositStatus,
}

mod string_i64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        String::deserialize(d)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreateDepositRequest {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpdateDepositRequest {
    pub status: LedgerDepositStatus,
    pub rollup_tx_hash: String,
    pub from_aa: String,
}

#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn latest_height(&self) -> Result<u64, ChainError>;

    /// All transactions of a block in block order
    async fn block_txs(&self, height: u64) -> Result<Vec<LedgerTx>, ChainError>;

    /// Returns the ledger tx hash
    async fn create_deposit(&self, request: &CreateDepositRequest) -> Result<String, ChainError>;

    async fn update_deposit(
        &self,
        tx_hash: &str,
        request: &UpdateDepositRequest,
    ) -> Result<String, ChainError>;

    async fn query_deposit(&self, tx_hash: &str) -> Result<LedgerDeposit, ChainError>;
}

#[derive(Deserialize)]
struct LatestBlockResponse {
    block: LatestBlock,
}

#[derive(Deserialize)]
struct LatestBlock {
    header: LatestHeader,
}

#[derive(Deserialize)]
struct LatestHeader {
    height: String,
}

#[derive(Deserialize)]
struct TxsResponse {
    #[serde(default)]
    txs: Vec<RawTx>,
    #[serde(default)]
    tx_responses: Vec<RawTxResponse>,
}

#[derive(Deserialize)]
struct RawTx {
    body: RawTxBody,
}

#[derive(Deserialize)]
struct RawTxBody {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawTxResponse {
    txhash: String,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    events: Vec<LedgerEvent>,
}

#[derive(Deserialize)]
struct QueryDepositResponse {
    deposit: LedgerDeposit,
}

/// Gateway broadcast answer
#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    code: u32,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    txhash: String,
}

impl BroadcastResponse {
    fn into_result(self) -> Result<String, ChainError> {
        if self.code == codes::OK {
            Ok(self.txhash)
        } else {
            Err(classify_code(self.code, &self.raw_log))
        }
    }
}

/// Pair the decoded bodies with their results; both lists are in block order
fn join_block_txs(response: TxsResponse) -> Vec<LedgerTx> {
    response
        .txs
        .into_iter()
        .zip(response.tx_responses)
        .map(|(tx, res)| LedgerTx {
            tx_hash: res.txhash,
            code: res.code,
            raw_log: res.raw_log,
            data: res.data,
            messages: tx.body.messages,
            events: res.events,
        })
        .collect()
}

pub struct RestLedgerClient {
    rest_url: String,
    gateway_url: String,
    client: reqwest::Client,
}

impl RestLedgerClient {
    pub fn new(config: &SettlementConfig) -> Result<Self, ChainError> {
        info!(
            "Initializing settlement ledger client at {} (gateway {})",
            config.rest_url, config.gateway_url
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl SettlementLedger for RestLedgerClient {
    async fn latest_height(&self) -> Result<u64, ChainError> {
        let url = format!("{}/cosmos/base/tendermint/v1beta1/blocks/latest", self.rest_url);
        let response: LatestBlockResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .block
            .header
            .height
            .parse()
            .map_err(|e| ChainError::Decode(format!("invalid ledger height: {}", e)))
    }

    async fn block_txs(&self, height: u64) -> Result<Vec<LedgerTx>, ChainError> {
        let url = format!(
            "{}/cosmos/tx/v1beta1/txs?events=tx.height={}&pagination.limit=1000",
            self.rest_url, height
        );
        let response: TxsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let txs = join_block_txs(response);
        debug!(height, count = txs.len(), "Fetched ledger block transactions");
        Ok(txs)
    }

    async fn create_deposit(&self, request: &CreateDepositRequest) -> Result<String, ChainError> {
        let url = format!("{}/bridge/v1/deposits", self.gateway_url);
        let response: BroadcastResponse = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .json()
            .await?;
        response.into_result()
    }

    async fn update_deposit(
        &self,
        tx_hash: &str,
        request: &UpdateDepositRequest,
    ) -> Result<String, ChainError> {
        let url = format!("{}/bridge/v1/deposits/{}", self.gateway_url, tx_hash);
        let response: BroadcastResponse = self
            .client
            .patch(&url)
            .json(request)
            .send()
            .await?
            .json()
            .await?;
        response.into_result()
    }

    async fn query_deposit(&self, tx_hash: &str) -> Result<LedgerDeposit, ChainError> {
        let url = format!("{}/ethermint/bridge/v1/deposit/{}", self.rest_url, tx_hash);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::IndexNotExists);
        }
        let body: QueryDepositResponse = response.error_for_status()?.json().await?;
        Ok(body.deposit)
    }
}
