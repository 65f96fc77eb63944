//! Bitcoin to EVM rollup bridge indexer
//!
//! # Modules
//!
//! - [`sentinel`] - Bitcoin, rollup and settlement ledger scanners
//! - [`bridge`] - deposit/withdraw/settlement orchestration and persistence
//! - [`chain`] - clients for the remote systems
//! - [`config`] - YAML configuration and named timing policies
//! - [`db`] - PostgreSQL pool and schema
//! - [`logging`] - tracing setup

pub mod bridge;
pub mod chain;
pub mod config;
pub mod db;
pub mod logging;
pub mod sentinel;

pub use bridge::BridgeError;
pub use chain::ChainError;
pub use config::AppConfig;
