//! Custodial signing service and fee-rate source
//!
//! The custody service holds the BTC keys. Every transfer is keyed by an
//! idempotent request id, so a request can always be looked up before it is
//! (re)submitted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::error::ChainError;
use crate::config::CustodyConfig;

const CODE_OK: i64 = 200;
const CODE_RECORD_NOT_FOUND: i64 = 2004;

/// A withdrawal as submitted to the custody service
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferIntent {
    pub request_id: String,
    pub vault_id: String,
    pub wallet_id: String,
    pub from: String,
    pub to: String,
    pub chain_symbol: String,
    pub asset_id: String,
    /// Satoshis as a decimal string
    pub amount: String,
}

/// The custody service's view of a transfer request
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustodyTransfer {
    pub custody_id: String,
    pub request_id: String,
    #[serde(default)]
    pub state: i32,
    /// Empty until the custody service has broadcast
    #[serde(default)]
    pub tx_hash: String,
}

#[async_trait]
pub trait CustodyApi: Send + Sync {
    /// `Ok(None)` when the custody service has never seen `request_id`
    async fn query_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<CustodyTransfer>, ChainError>;

    /// Network fee quote for the transfer
    async fn estimate_fee(&self, intent: &TransferIntent) -> Result<String, ChainError>;

    async fn create_transfer(
        &self,
        intent: &TransferIntent,
        fee_rate: u64,
    ) -> Result<CustodyTransfer, ChainError>;
}

#[async_trait]
pub trait FeeRateSource: Send + Sync {
    /// sat/vB for next-block inclusion
    async fn fastest_fee(&self) -> Result<u64, ChainError>;
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<Option<T>, ChainError> {
        match self.code {
            CODE_OK => Ok(self.data),
            CODE_RECORD_NOT_FOUND => Err(ChainError::RequestNotFound),
            code => Err(ChainError::Rejected(format!("{}: {}", code, self.msg))),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    request_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    #[serde(flatten)]
    intent: &'a TransferIntent,
    fee_rate: String,
}

#[derive(Deserialize)]
struct FeeData {
    fee: String,
}

pub struct HttpCustodyClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpCustodyClient {
    pub fn new(config: &CustodyConfig) -> Result<Self, ChainError> {
        info!("Initializing custody client at {}", config.base_url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<Option<R>, ChainError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let response: ApiResponse<R> = self
            .client
            .post(&url)
            .header("BIZ-API-KEY", &self.api_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_data()
    }
}

#[async_trait]
impl CustodyApi for HttpCustodyClient {
    async fn query_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<CustodyTransfer>, ChainError> {
        match self
            .post(
                "/v1/waas/mpc/transaction/query_by_request_id",
                &QueryRequest { request_id },
            )
            .await
        {
            Ok(found) => Ok(found),
            Err(ChainError::RequestNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn estimate_fee(&self, intent: &TransferIntent) -> Result<String, ChainError> {
        let data: Option<FeeData> = self.post("/v1/waas/mpc/transaction/fee", intent).await?;
        data.map(|d| d.fee)
            .ok_or_else(|| ChainError::Decode("fee estimate without data".into()))
    }

    async fn create_transfer(
        &self,
        intent: &TransferIntent,
        fee_rate: u64,
    ) -> Result<CustodyTransfer, ChainError> {
        let body = CreateRequest {
            intent,
            fee_rate: fee_rate.to_string(),
        };
        let data: Option<CustodyTransfer> =
            self.post("/v1/waas/mpc/transaction/transfer", &body).await?;
        let transfer =
            data.ok_or_else(|| ChainError::Decode("create transfer without data".into()))?;
        debug!(
            request_id = %transfer.request_id,
            custody_id = %transfer.custody_id,
            "Custody transfer created"
        );
        Ok(transfer)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: u64,
}

/// mempool.space-compatible fee API
pub struct MempoolFeeClient {
    base_url: String,
    client: reqwest::Client,
}

impl MempoolFeeClient {
    pub fn new(base_url: &str) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl FeeRateSource for MempoolFeeClient {
    async fn fastest_fee(&self) -> Result<u64, ChainError> {
        let url = format!("{}/v1/fees/recommended", self.base_url);
        let fees: RecommendedFees = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(fees.fastest_fee)
    }
}
