//! Chain scanners
//!
//! Each source chain is read in order from a persisted [`IndexCursor`]
//! (`height`, `tx_index`, `log_index`). Events and the cursor that covers
//! them are written together, so a restart resumes after the last stored
//! event and never records one twice.
//!
//! [`IndexCursor`]: crate::bridge::IndexCursor

pub mod btc;
pub mod confirmation;
pub mod error;
pub mod ledger;
pub mod rollup;
pub mod scanner;
pub mod worker;

pub use btc::BitcoinChainScanner;
pub use confirmation::ConfirmationWatcher;
pub use error::ScannerError;
pub use ledger::SettlementLedgerScanner;
pub use rollup::RollupEventScanner;
pub use scanner::{BlockSource, EventSink, ScannedBlock, ScannedEvent};
pub use worker::{CursorWorker, ScanOutcome};
