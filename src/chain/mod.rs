//! Remote system clients
//!
//! Each remote system is a capability trait with one production
//! implementation. Workers and orchestrators only see the traits.

pub mod address;
pub mod bitcoin;
pub mod custody;
pub mod error;
pub mod ledger;
pub mod minter;
pub mod rollup;

pub use address::{AddressResolver, HttpAddressResolver};
pub use bitcoin::{BitcoinCoreClient, BitcoinRpc, BlockInfo};
pub use custody::{CustodyApi, FeeRateSource, HttpCustodyClient, MempoolFeeClient};
pub use error::ChainError;
pub use ledger::{RestLedgerClient, SettlementLedger};
pub use minter::{EvmMinter, MinedStatus, RollupMinter, SignedTransfer};
pub use rollup::{JsonRpcRollupClient, RollupRpc};
