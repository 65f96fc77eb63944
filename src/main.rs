//! Bitcoin bridge indexer
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ BTC scanner │──▶│ deposit saga │──▶│ rollup mint │
//! └─────────────┘   └──────────────┘   └─────────────┘
//! ┌────────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ rollup scanner │──▶│ withdraw saga │──▶│ confirmation │
//! └────────────────┘   └───────────────┘   └──────────────┘
//! ```
//!
//! Every worker is an independent tokio task sharing one PostgreSQL store.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::Address;
use btc_bridge_indexer::bridge::{
    DepositOrchestrator, PgBridgeStore, SettlementOrchestrator, SettlementPhase, SweepWorker,
    WithdrawOrchestrator,
};
use btc_bridge_indexer::chain::{
    BitcoinCoreClient, BitcoinRpc, EvmMinter, HttpAddressResolver, HttpCustodyClient,
    JsonRpcRollupClient, MempoolFeeClient, RestLedgerClient, RollupRpc, SettlementLedger,
};
use btc_bridge_indexer::config::AppConfig;
use btc_bridge_indexer::db::{Database, init_schema};
use btc_bridge_indexer::sentinel::{
    BitcoinChainScanner, ConfirmationWatcher, CursorWorker, RollupEventScanner,
    SettlementLedgerScanner,
};

// ============================================================
// ARGUMENTS
// ============================================================

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1).cloned())
}

fn load_config() -> Result<AppConfig> {
    let config = match arg_value(&["--config"]) {
        Some(path) => AppConfig::from_file(&path),
        None => AppConfig::load(&arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())),
    };
    Ok(config?)
}

// ============================================================
// STARTUP PROBES
// ============================================================

struct Clients {
    bitcoin: Arc<dyn BitcoinRpc>,
    rollup: Arc<dyn RollupRpc>,
    ledger: Arc<dyn SettlementLedger>,
}

/// Unreachable endpoints abort startup
async fn probe(config: &AppConfig, clients: &Clients) -> Result<()> {
    let workers = &config.workers;

    if workers.btc_scanner || workers.confirmation {
        let height = clients
            .bitcoin
            .block_count()
            .await
            .context("bitcoin node unreachable")?;
        tracing::info!(height, "Bitcoin node reachable");
    }

    if workers.deposit || workers.rollup_scanner {
        let height = clients
            .rollup
            .block_number()
            .await
            .context("rollup node unreachable")?;
        let chain_id = clients.rollup.chain_id().await?;
        if chain_id != config.rollup.chain_id {
            anyhow::bail!(
                "rollup chain id {} does not match configured {}",
                chain_id,
                config.rollup.chain_id
            );
        }
        tracing::info!(height, chain_id, "Rollup node reachable");
    }

    if workers.ledger_scanner || workers.settlement {
        let height = clients
            .ledger
            .latest_height()
            .await
            .context("settlement ledger unreachable")?;
        tracing::info!(height, "Settlement ledger reachable");
    }

    Ok(())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = btc_bridge_indexer::logging::init_logging(&config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        network = %config.bitcoin.network,
        "Starting bitcoin bridge indexer"
    );

    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .context("database connection failed")?;
    init_schema(db.pool()).await.context("schema initialization failed")?;
    let store = Arc::new(PgBridgeStore::new(db.pool().clone()));

    let clients = Clients {
        bitcoin: Arc::new(BitcoinCoreClient::new(&config.bitcoin)?),
        rollup: Arc::new(JsonRpcRollupClient::new(&config.rollup.rpc_url)?),
        ledger: Arc::new(RestLedgerClient::new(&config.settlement)?),
    };
    probe(&config, &clients).await?;

    let policies = &config.policies;
    let workers = &config.workers;
    let mut tasks = Vec::new();

    if workers.btc_scanner {
        let scanner = BitcoinChainScanner::new(clients.bitcoin.clone(), &config.bitcoin)?;
        let worker = CursorWorker::new(scanner, store.clone(), policies.btc_scan);
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    if workers.deposit {
        let bridge_contract = Address::from_str(&config.rollup.bridge_contract)
            .context("rollup.bridge_contract")?;
        let minter = EvmMinter::new(
            clients.rollup.clone(),
            &config.rollup.private_key,
            bridge_contract,
            config.rollup.chain_id,
            config.rollup.gas_price_multiple,
        )?;
        let resolver = HttpAddressResolver::new(&config.address_service)?;
        let orchestrator = DepositOrchestrator::new(
            Arc::new(minter),
            Arc::new(resolver),
            store.clone(),
            policies.mint_wait,
            policies.fallback_wait,
            policies.deposit_sweep.stale_after,
        );
        let worker = SweepWorker::new(orchestrator, policies.deposit_sweep);
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    if workers.rollup_scanner {
        let scanner = RollupEventScanner::new(
            clients.rollup.clone(),
            store.clone(),
            &config.rollup,
            &config.bitcoin.custody_address,
            policies.rollup_scan,
        )?;
        tasks.push(tokio::spawn(async move { scanner.run().await }));
    }

    if workers.withdraw {
        let orchestrator = WithdrawOrchestrator::new(
            Arc::new(HttpCustodyClient::new(&config.custody)?),
            Arc::new(MempoolFeeClient::new(&config.custody.fee_api_url)?),
            store.clone(),
            config.custody.clone(),
            policies.withdraw_sweep.stale_after,
        );
        let worker = SweepWorker::new(orchestrator, policies.withdraw_sweep);
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    if workers.confirmation {
        let watcher = ConfirmationWatcher::new(
            clients.bitcoin.clone(),
            store.clone(),
            config.bitcoin.withdraw_confirmations,
        );
        let worker = SweepWorker::new(watcher, policies.confirmation_poll);
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    if workers.ledger_scanner {
        let scanner =
            SettlementLedgerScanner::new(clients.ledger.clone(), &config.settlement.bridge_module);
        let worker = CursorWorker::new(scanner, store.clone(), policies.ledger_scan);
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    if workers.settlement {
        for (phase, policy) in [
            (SettlementPhase::Create, &policies.settlement_create_sweep),
            (SettlementPhase::Update, &policies.settlement_update_sweep),
        ] {
            let orchestrator =
                SettlementOrchestrator::new(clients.ledger.clone(), store.clone(), phase);
            let worker = SweepWorker::new(orchestrator, *policy);
            tasks.push(tokio::spawn(async move { worker.run().await }));
        }
    }

    tracing::info!(workers = tasks.len(), "All workers started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping workers");
    for task in &tasks {
        task.abort();
    }

    Ok(())
}
