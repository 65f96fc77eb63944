//! Periodic batch sweeps
//!
//! A sweep selects a bounded batch of records and handles them one by one.
//! Each record runs behind its own error boundary: an error or a panic is
//! logged and the batch continues with the next record.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use crate::config::SweepPolicy;

#[async_trait]
pub trait Sweep: Send + Sync {
    type Item: Send + Sync;

    fn name(&self) -> &'static str;

    /// Identifies an item in logs
    fn item_key(item: &Self::Item) -> String;

    async fn select(&self, limit: usize) -> Result<Vec<Self::Item>, BridgeError>;

    async fn handle(&self, item: &Self::Item) -> Result<(), BridgeError>;
}

/// Counts of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

pub struct SweepWorker<S> {
    sweep: S,
    policy: SweepPolicy,
}

impl<S: Sweep> SweepWorker<S> {
    pub fn new(sweep: S, policy: SweepPolicy) -> Self {
        Self { sweep, policy }
    }

    pub fn sweep(&self) -> &S {
        &self.sweep
    }

    pub async fn run(&self) {
        info!(
            sweep = self.sweep.name(),
            interval = ?self.policy.interval,
            batch_size = self.policy.batch_size,
            "Sweep worker starting"
        );

        loop {
            let report = self.sweep_once().await;
            if report.selected > 0 {
                info!(sweep = self.sweep.name(), ?report, "Sweep finished");
            }
            sleep(self.policy.interval).await;
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let name = self.sweep.name();
        let mut report = SweepReport::default();

        let items = match self.sweep.select(self.policy.batch_size).await {
            Ok(items) => items,
            Err(e) => {
                error!(sweep = name, "Failed to select batch: {}", e);
                return report;
            }
        };
        report.selected = items.len();
        if items.is_empty() {
            debug!(sweep = name, "Nothing to do");
            return report;
        }

        for item in &items {
            let key = S::item_key(item);
            let outcome = AssertUnwindSafe(self.sweep.handle(item))
                .catch_unwind()
                .await;

            let failed = match outcome {
                Ok(Ok(())) => {
                    report.succeeded += 1;
                    false
                }
                Ok(Err(e)) => {
                    warn!(sweep = name, item = %key, code = e.code(), "Item failed: {}", e);
                    report.failed += 1;
                    true
                }
                Err(panic) => {
                    error!(sweep = name, item = %key, "Item panicked: {}", panic_message(&*panic));
                    report.panicked += 1;
                    true
                }
            };

            if !self.policy.item_delay.is_zero() {
                sleep(self.policy.item_delay).await;
            }
            if failed && !self.policy.error_backoff.is_zero() {
                sleep(self.policy.error_backoff).await;
            }
        }

        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
