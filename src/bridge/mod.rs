//! Bridge core: records, state machines, persistence and the orchestrators
//! that move deposits and withdrawals between the chains.
//!
//! - [`deposit`] - BTC deposit saga with fallback transfer
//! - [`withdraw`] - rollup withdrawal submitted to the custody service
//! - [`settlement`] - settlement ledger create/update sweeps
//! - [`callback`] - custody service callback validation
//! - [`worker`] - generic sweep loop shared by the orchestrators

pub mod callback;
pub mod db;
pub mod deposit;
pub mod error;
pub mod settlement;
pub mod state;
pub mod store;
pub mod types;
pub mod withdraw;
pub mod worker;

#[cfg(test)]
pub(crate) mod memory;


pub use callback::{
    CallbackCode, CallbackHandler, CallbackResponse, TransactionNotify, WithdrawalConfirm,
};
pub use db::PgBridgeStore;
pub use deposit::DepositOrchestrator;
pub use error::BridgeError;
pub use settlement::{SettlementOrchestrator, SettlementPhase};
pub use state::{DepositState, FallbackStatus, SettlementStatus, WithdrawStatus};
pub use store::{CursorStore, DepositStore, LedgerStore, WithdrawStore};
pub use types::{
    ChainKind, DepositRecord, IndexCursor, TransferEvent, WithdrawEvent, WithdrawRecord,
};
pub use withdraw::WithdrawOrchestrator;
pub use worker::{Sweep, SweepReport, SweepWorker};
