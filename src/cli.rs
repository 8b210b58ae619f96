//! CLI entry point and composition root.
//!
//! # Commands
//!
//! - `serve`: run the full backend (indexers, matchers, scheduler, API)
//! - `status`: print checkpoint and payment state, then exit
//! - `snapshot`: capture the daily wallet snapshot immediately, then exit
//!
//! `serve` wires the layers together: configuration, database, chain
//! clients, the decoder registry, per-subscription indexer tasks (pool
//! worker sets for the sharded staking streams, plain indexers for the
//! rest), native payment scanners, one payment matcher per custodial
//! wallet, the scheduler and the API server. A single Ctrl-C propagates
//! one cancellation token through every task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::server::run_server;
use crate::app_state::AppState;
use crate::chain::ChainClient;
use crate::config::Config;
use crate::db;
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::DecoderRegistry;
use crate::indexer::native::NativeScanner;
use crate::indexer::sink::{EventSink, LedgerSink};
use crate::indexer::steal::{discover_pools, GardenRangeScanner, PoolWorkerPool};
use crate::indexer::{Indexer, IndexerConfig, StoredEvent};
use crate::payments::PaymentMatcher;
use crate::pricing::PriceOracle;
use crate::scheduler::{ManagedTask, Scheduler};
use crate::valuation::ValuationEngine;

/// Multi-chain game-economy indexing and reconciliation backend.
#[derive(Parser, Debug)]
#[command(name = "realm-ledger", version, about)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full backend: indexers, matchers, scheduler and API.
    Serve,
    /// Print checkpoint and payment state, then exit.
    Status,
    /// Capture the daily wallet snapshot immediately, then exit.
    Snapshot,
}

/// Parse the command line and dispatch.
///
/// # Errors
///
/// Configuration, database or wiring failures; runtime errors inside the
/// long-running tasks are handled by the tasks themselves.
pub async fn run() -> LedgerResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_serve().await,
        Commands::Status => run_status().await,
        Commands::Snapshot => run_snapshot().await,
    }
}

/// Shared bring-up: config, database, repository, chain clients.
async fn bootstrap() -> LedgerResult<(Config, Arc<Repository>, HashMap<u64, Arc<ChainClient>>)> {
    let config = Config::from_env()?;

    let pool =
        db::create_pool_with_fallback(config.database_url(), config.fallback_database_url()).await?;
    let repo = Arc::new(Repository::new(pool));

    let mut clients = HashMap::new();
    for (chain_id, settings) in config.chains() {
        repo.seed_chain(&settings.descriptor).await?;
        clients.insert(
            *chain_id,
            Arc::new(ChainClient::new(settings.descriptor.clone())?),
        );
    }

    Ok((config, repo, clients))
}

#[allow(clippy::too_many_lines)]
async fn run_serve() -> LedgerResult<()> {
    let (config, repo, clients) = bootstrap().await?;

    println!(
        "{} {}",
        "realm-ledger".cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!(
        "  chains: {}  subscriptions: {}  mode: {}",
        config.chains().len(),
        config.subscriptions().len(),
        if config.production_mode() {
            "production".green().bold()
        } else {
            "standby (operator start required)".yellow().bold()
        }
    );

    let registry = Arc::new(DecoderRegistry::new());
    let sink: Arc<dyn EventSink> = Arc::new(LedgerSink::new(repo.clone()));

    let oracle = Arc::new(
        PriceOracle::new(repo.clone())
            .with_stables(config.stable_tokens().iter().cloned().collect::<HashSet<_>>())
            .with_deprecated(
                config
                    .deprecated_tokens()
                    .iter()
                    .cloned()
                    .collect::<HashSet<_>>(),
            ),
    );
    let valuation = Arc::new(ValuationEngine::new(
        clients.clone(),
        repo.clone(),
        oracle.clone(),
    ));

    // Discover pools before the worker sets start scanning them.
    for sub in config.subscriptions() {
        let version = match sub.decoder_key.as_str() {
            "pool_staking_v1" => "v1",
            "pool_staking_v2" => "v2",
            _ => continue,
        };
        let Some(client) = clients.get(&sub.chain_id) else {
            continue;
        };
        let Ok(master) = sub.address.parse() else {
            continue;
        };
        if let Err(e) = discover_pools(client, &repo, master, version).await {
            warn!(chain_id = sub.chain_id, error = %e, "Pool discovery failed; worker set starts empty");
        }
    }

    // Wallets the daily snapshot tracks, and the tokens it reads.
    let mut tracked_wallets: HashMap<u64, Vec<_>> = HashMap::new();
    let mut snapshot_tokens: HashMap<u64, Vec<_>> = HashMap::new();
    for (chain_id, settings) in config.chains() {
        if let Some(wallet) = settings.custodial_wallet {
            tracked_wallets.entry(*chain_id).or_default().push(wallet);
        }
        if let Some(token) = settings.payment_token {
            snapshot_tokens.entry(*chain_id).or_default().push(token);
        }
    }

    let mut scheduler = Scheduler::new(
        repo.clone(),
        oracle,
        valuation.clone(),
        clients.clone(),
        tracked_wallets,
        snapshot_tokens,
        config.production_mode(),
    );

    // Transfer streams feeding the payment matchers, keyed by chain.
    let mut transfer_streams: HashMap<u64, Vec<tokio::sync::broadcast::Receiver<StoredEvent>>> =
        HashMap::new();

    for sub in config.subscriptions() {
        repo.seed_subscription(sub).await?;
        let Some(client) = clients.get(&sub.chain_id) else {
            continue;
        };
        let Ok(contract) = sub.address.parse::<alloy::primitives::Address>() else {
            warn!(address = %sub.address, "Skipping subscription with malformed address");
            continue;
        };
        let name = format!("{}/{}", client.descriptor().name, sub.decoder_key);
        let checkpoint_scope = (sub.chain_id, sub.address.clone());

        match sub.decoder_key.as_str() {
            "pool_staking_v1" | "pool_staking_v2" => {
                let scanner = Arc::new(GardenRangeScanner::new(
                    client.clone(),
                    registry.clone(),
                    repo.clone(),
                    sink.clone(),
                    contract,
                    sub.decoder_key.clone(),
                ));
                let workers = Arc::new(PoolWorkerPool::new(
                    &name,
                    client.clone(),
                    repo.clone(),
                    scanner,
                    contract,
                    sub.start_block,
                    config.workers_per_pool(),
                    config.batch_blocks(),
                    sub.enabled,
                ));
                scheduler.register(ManagedTask::pool(workers, checkpoint_scope));
            }
            _ => {
                let indexer = Arc::new(Indexer::new(
                    IndexerConfig {
                        name,
                        chain_id: sub.chain_id,
                        contract,
                        decoder_key: sub.decoder_key.clone(),
                        shard_key: String::new(),
                        start_block: sub.start_block,
                        batch_blocks: config.batch_blocks(),
                        max_batch_blocks: config.batch_blocks() * 4,
                    },
                    client.clone(),
                    registry.clone(),
                    repo.clone(),
                    sink.clone(),
                    sub.enabled,
                ));
                if sub.decoder_key == "erc20_transfer" {
                    transfer_streams
                        .entry(sub.chain_id)
                        .or_default()
                        .push(indexer.subscribe());
                }
                scheduler.register(ManagedTask::log(indexer, checkpoint_scope));
            }
        }
    }

    // Native scanners for chains with a custodial wallet.
    for (chain_id, settings) in config.chains() {
        let Some(wallet) = settings.custodial_wallet else {
            continue;
        };
        let Some(client) = clients.get(chain_id) else {
            continue;
        };
        let scanner = Arc::new(NativeScanner::new(
            client.clone(),
            repo.clone(),
            wallet,
            1,
            true,
        ));
        transfer_streams
            .entry(*chain_id)
            .or_default()
            .push(scanner.subscribe());
        scheduler.register(ManagedTask::native(scanner, *chain_id));
    }

    let scheduler = Arc::new(scheduler);
    let root = CancellationToken::new();

    // One matcher per custodial wallet, consuming every transfer stream
    // on its chain.
    for (chain_id, settings) in config.chains() {
        let Some(wallet) = settings.custodial_wallet else {
            continue;
        };
        let matcher = Arc::new(PaymentMatcher::new(
            repo.clone(),
            wallet,
            settings.payment_token,
        ));
        for receiver in transfer_streams.remove(chain_id).unwrap_or_default() {
            tokio::spawn(matcher.clone().run(receiver, root.child_token()));
        }
        info!(chain_id, wallet = %wallet, "Payment matcher wired");
    }

    let state = AppState::new(
        repo,
        valuation,
        scheduler.clone(),
        config.admin_token().map(str::to_string),
    );

    tokio::spawn(scheduler.run(root.child_token()));

    let server_token = root.child_token();
    let server = tokio::spawn(run_server(
        state,
        config.api_port(),
        config.rate_limit_rpm(),
        config.cors_origins().to_vec(),
        server_token,
    ));

    // Block until Ctrl-C, then unwind everything.
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    println!();
    println!("{}", "Shutting down gracefully...".yellow().bold());
    root.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server exited with error"),
        Err(e) => error!(error = %e, "API server task failed"),
    }

    println!("{}", "Shutdown complete".green().bold());
    Ok(())
}

async fn run_status() -> LedgerResult<()> {
    let (_config, repo, _clients) = bootstrap().await?;

    let checkpoints = repo.list_checkpoints().await?;
    if checkpoints.is_empty() {
        println!("{}", "No checkpoints yet".yellow());
    } else {
        println!("{}", "Checkpoints".cyan().bold());
        for row in checkpoints {
            let shard = if row.shard_key.is_empty() {
                "-".to_string()
            } else {
                row.shard_key.clone()
            };
            println!(
                "  chain {:>12}  {}  shard {:>4}  block {}",
                row.chain_id,
                row.contract_address,
                shard,
                row.last_processed_block.to_string().green()
            );
        }
    }

    let now = chrono::Utc::now().timestamp();
    let pending = repo.pending_requests(now).await?;
    println!(
        "{} {}",
        "Pending payment requests:".cyan().bold(),
        pending.len()
    );

    Ok(())
}

async fn run_snapshot() -> LedgerResult<()> {
    let (config, repo, clients) = bootstrap().await?;

    let mut tracked_wallets: HashMap<u64, Vec<_>> = HashMap::new();
    let mut snapshot_tokens: HashMap<u64, Vec<_>> = HashMap::new();
    for (chain_id, settings) in config.chains() {
        if let Some(wallet) = settings.custodial_wallet {
            tracked_wallets.entry(*chain_id).or_default().push(wallet);
        }
        if let Some(token) = settings.payment_token {
            snapshot_tokens.entry(*chain_id).or_default().push(token);
        }
    }

    if tracked_wallets.is_empty() {
        return Err(LedgerError::config(
            "No custodial wallets configured; set CUSTODIAL_WALLET_<chain_id>",
            None,
        ));
    }

    let oracle = Arc::new(PriceOracle::new(repo.clone()));
    let valuation = Arc::new(ValuationEngine::new(
        clients.clone(),
        repo.clone(),
        oracle.clone(),
    ));
    let scheduler = Scheduler::new(
        repo,
        oracle,
        valuation,
        clients,
        tracked_wallets,
        snapshot_tokens,
        false,
    );

    let captured = scheduler.capture_wallet_snapshots().await?;
    println!("{} {}", "Snapshots captured:".green().bold(), captured);
    Ok(())
}
