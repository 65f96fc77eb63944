//! Application configuration
//!
//! Loaded from `config/{env}.yaml`. Every wait and poll interval used by the
//! workers is a named policy under `policies`, with defaults equal to the
//! production values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: DatabaseConfig,
    pub bitcoin: BitcoinConfig,
    pub rollup: RollupConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub address_service: AddressServiceConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BitcoinConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    /// `bitcoin`, `testnet`, `signet` or `regtest`
    pub network: String,
    /// Address whose incoming payments are deposits
    pub custody_address: String,
    /// Depth a block must reach before it is scanned
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u32,
    /// Depth a withdrawal transaction must reach before it is finalized
    #[serde(default = "default_withdraw_confirmations")]
    pub withdraw_confirmations: u32,
}

fn default_block_confirmations() -> u32 {
    1
}

fn default_withdraw_confirmations() -> u32 {
    6
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RollupConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Hex private key of the minting account. Prefer `ROLLUP_PRIVATE_KEY`.
    #[serde(default)]
    pub private_key: String,
    pub bridge_contract: String,
    pub deposit_topic: String,
    pub withdraw_topic: String,
    /// Multiplies the suggested gas price; 0 or 1 keeps it unchanged
    #[serde(default)]
    pub gas_price_multiple: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementConfig {
    pub rest_url: String,
    /// Signing gateway that broadcasts bridge-module messages
    pub gateway_url: String,
    /// Message type prefix of the bridge module, e.g. `/ethermint.bridge.v1.`
    pub bridge_module: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://127.0.0.1:1317".to_string(),
            gateway_url: "http://127.0.0.1:1318".to_string(),
            bridge_module: "/ethermint.bridge.v1.".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustodyConfig {
    pub base_url: String,
    /// Prefer `CUSTODY_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    pub vault_id: String,
    pub wallet_id: String,
    pub chain_symbol: String,
    pub asset_id: String,
    pub fee_api_url: String,
    /// Comma separated list of callback source IPs; empty allows none
    #[serde(default)]
    pub callback_ip_allow_list: String,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            api_key: String::new(),
            vault_id: String::new(),
            wallet_id: String::new(),
            chain_symbol: "BTC".to_string(),
            asset_id: "BTC_BTC".to_string(),
            fee_api_url: "https://mempool.space/api".to_string(),
            callback_ip_allow_list: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AddressServiceConfig {
    pub url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for AddressServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/v1/btc/pubkey".to_string(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Which long-lived workers the binary spawns
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkersConfig {
    pub btc_scanner: bool,
    pub deposit: bool,
    pub rollup_scanner: bool,
    pub withdraw: bool,
    pub confirmation: bool,
    pub ledger_scanner: bool,
    pub settlement: bool,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            btc_scanner: true,
            deposit: true,
            rollup_scanner: true,
            withdraw: true,
            confirmation: true,
            ledger_scanner: false,
            settlement: false,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Timing of a block scan loop
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Sleep when caught up with the chain tip
    #[serde(rename = "new_block_wait_ms", with = "millis")]
    pub new_block_wait: Duration,
    /// Sleep after each fully processed height
    #[serde(rename = "block_interval_ms", with = "millis")]
    pub block_interval: Duration,
    /// Sleep after each persisted event
    #[serde(rename = "tx_interval_ms", with = "millis")]
    pub tx_interval: Duration,
}

impl ScanPolicy {
    pub fn bitcoin() -> Self {
        Self {
            new_block_wait: Duration::from_secs(60),
            block_interval: Duration::from_secs(2),
            tx_interval: Duration::from_millis(100),
        }
    }

    pub fn rollup() -> Self {
        Self {
            new_block_wait: Duration::from_secs(10),
            block_interval: Duration::ZERO,
            tx_interval: Duration::ZERO,
        }
    }

    pub fn ledger() -> Self {
        Self {
            new_block_wait: Duration::from_secs(1),
            block_interval: Duration::from_secs(1),
            tx_interval: Duration::from_millis(100),
        }
    }
}

/// Timing of a periodic batch sweep
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    pub batch_size: usize,
    #[serde(rename = "item_delay_ms", with = "millis")]
    pub item_delay: Duration,
    /// Extra sleep after an item fails
    #[serde(rename = "error_backoff_ms", with = "millis")]
    pub error_backoff: Duration,
    /// Age after which an in-flight record is considered abandoned
    #[serde(rename = "stale_after_ms", with = "millis", default = "default_stale_after")]
    pub stale_after: Duration,
}

fn default_stale_after() -> Duration {
    Duration::from_secs(300)
}

impl SweepPolicy {
    pub fn deposit() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            item_delay: Duration::from_secs(1),
            error_backoff: Duration::from_secs(20),
            stale_after: default_stale_after(),
        }
    }

    /// For withdrawals `stale_after` is the delay before a fresh record is submitted.
    pub fn withdraw() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 10,
            item_delay: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            stale_after: Duration::from_secs(10),
        }
    }

    pub fn settlement_create() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            item_delay: Duration::from_secs(1),
            error_backoff: Duration::from_secs(600),
            stale_after: default_stale_after(),
        }
    }

    pub fn settlement_update() -> Self {
        Self {
            interval: Duration::from_secs(60),
            ..Self::settlement_create()
        }
    }

    pub fn confirmation() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            item_delay: Duration::ZERO,
            error_backoff: Duration::ZERO,
            stale_after: default_stale_after(),
        }
    }
}

/// Bounded wait for on-chain inclusion
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn mint() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 60 * 60),
            poll_interval: Duration::from_secs(3),
        }
    }

    pub fn fallback() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoliciesConfig {
    #[serde(default = "ScanPolicy::bitcoin")]
    pub btc_scan: ScanPolicy,
    #[serde(default = "ScanPolicy::rollup")]
    pub rollup_scan: ScanPolicy,
    #[serde(default = "ScanPolicy::ledger")]
    pub ledger_scan: ScanPolicy,
    #[serde(default = "SweepPolicy::deposit")]
    pub deposit_sweep: SweepPolicy,
    #[serde(default = "WaitPolicy::mint")]
    pub mint_wait: WaitPolicy,
    #[serde(default = "WaitPolicy::fallback")]
    pub fallback_wait: WaitPolicy,
    #[serde(default = "SweepPolicy::withdraw")]
    pub withdraw_sweep: SweepPolicy,
    #[serde(default = "SweepPolicy::confirmation")]
    pub confirmation_poll: SweepPolicy,
    #[serde(default = "SweepPolicy::settlement_create")]
    pub settlement_create_sweep: SweepPolicy,
    #[serde(default = "SweepPolicy::settlement_update")]
    pub settlement_update_sweep: SweepPolicy,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            btc_scan: ScanPolicy::bitcoin(),
            rollup_scan: ScanPolicy::rollup(),
            ledger_scan: ScanPolicy::ledger(),
            deposit_sweep: SweepPolicy::deposit(),
            mint_wait: WaitPolicy::mint(),
            fallback_wait: WaitPolicy::fallback(),
            withdraw_sweep: SweepPolicy::withdraw(),
            confirmation_poll: SweepPolicy::confirmation(),
            settlement_create_sweep: SweepPolicy::settlement_create(),
            settlement_update_sweep: SweepPolicy::settlement_update(),
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml` and apply environment overrides
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Replace secrets with values from `lookup` when present
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("ROLLUP_PRIVATE_KEY") {
            self.rollup.private_key = key;
        }
        if let Some(key) = lookup("CUSTODY_API_KEY") {
            self.custody.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid("database.url is empty".into()));
        }
        if self.workers.btc_scanner && self.bitcoin.custody_address.is_empty() {
            return Err(ConfigError::Invalid(
                "bitcoin.custody_address is required by the btc scanner".into(),
            ));
        }
        if self.workers.deposit && self.rollup.private_key.is_empty() {
            return Err(ConfigError::Invalid(
                "rollup.private_key is required by the deposit worker".into(),
            ));
        }
        if self.bitcoin.withdraw_confirmations == 0 {
            return Err(ConfigError::Invalid(
                "bitcoin.withdraw_confirmations must be positive".into(),
            ));
        }
        Ok(())
    }
}
