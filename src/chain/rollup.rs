//! Rollup (EVM) JSON-RPC access
//!
//! Only the handful of methods the bridge needs. Quantities arrive as hex
//! strings and are parsed at the edge.

use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::error::ChainError;

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("invalid quantity {}: {}", value, e)))
}

fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: String,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    pub fn block_number(&self) -> Result<u64, ChainError> {
        parse_quantity(&self.block_number)
    }

    pub fn tx_index(&self) -> Result<u64, ChainError> {
        parse_quantity(&self.transaction_index)
    }

    pub fn log_index(&self) -> Result<u64, ChainError> {
        parse_quantity(&self.log_index)
    }
}

/// `eth_getLogs` filter over one contract and a set of alternative topic0 values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Address,
    pub topics: Vec<B256>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcLogFilter {
    from_block: String,
    to_block: String,
    address: Address,
    topics: Vec<Vec<B256>>,
}

impl From<&LogFilter> for RpcLogFilter {
    fn from(f: &LogFilter) -> Self {
        Self {
            from_block: to_quantity(f.from_block),
            to_block: to_quantity(f.to_block),
            address: f.address,
            topics: vec![f.topics.clone()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl TxReceipt {
    /// Status `0x1`
    pub fn is_success(&self) -> bool {
        self.status
            .as_deref()
            .and_then(|s| parse_quantity(s).ok())
            .is_some_and(|s| s == 1)
    }
}

/// Call used for gas estimation
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    #[serde(rename = "data")]
    pub input: Bytes,
}

/// Capabilities of the rollup node
#[async_trait]
pub trait RollupRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError>;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Revert reasons are classified into `ChainError` kinds
    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, ChainError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ChainError>;
}

/// Plain HTTP JSON-RPC client
pub struct JsonRpcRollupClient {
    url: String,
    client: reqwest::Client,
}

impl JsonRpcRollupClient {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        info!("Initializing rollup RPC client at {}", url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Make a JSON-RPC call; a `null` result is `Ok(None)`
    async fn rpc_call_opt<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response: JsonRpcResponse<R> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            debug!(method, code = error.code, message = %error.message, "rollup RPC error");
            return Err(ChainError::from_rpc(error.code, &error.message));
        }

        Ok(response.result)
    }

    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        self.rpc_call_opt(method, params)
            .await?
            .ok_or_else(|| ChainError::Decode(format!("No result in {} response", method)))
    }
}

#[async_trait]
impl RollupRpc for JsonRpcRollupClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let result: String = self.rpc_call("eth_blockNumber", ()).await?;
        parse_quantity(&result)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError> {
        self.rpc_call("eth_getLogs", [RpcLogFilter::from(filter)])
            .await
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let result: String = self.rpc_call("eth_chainId", ()).await?;
        parse_quantity(&result)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let result: String = self
            .rpc_call("eth_getTransactionCount", (address, "pending"))
            .await?;
        parse_quantity(&result)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let result: String = self.rpc_call("eth_gasPrice", ()).await?;
        u128::from_str_radix(result.trim_start_matches("0x"), 16)
            .map_err(|e| ChainError::Decode(format!("invalid gas price {}: {}", result, e)))
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        let result: String = self.rpc_call("eth_estimateGas", [call]).await?;
        parse_quantity(&result)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, ChainError> {
        let encoded = format!("0x{}", hex::encode(raw));
        self.rpc_call("eth_sendRawTransaction", [encoded]).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        self.rpc_call_opt("eth_getTransactionReceipt", [hash]).await
    }
}
