mod airdrop;
mod config;
mod db;
mod error;
mod indexer;
mod models;
mod rpc;
mod scheduler;
mod snapshot;
#[cfg(test)]
mod testutil;

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ethers::signers::LocalWallet;
use ethers::types::Address;

use crate::airdrop::Distributor;
use crate::config::{parse_address, AppConfig, PRIVATE_KEY_ENV};
use crate::models::Contract;
use crate::rpc::{EthersRpc, RetryPolicy};
use crate::scheduler::AirdropOutcome;
use crate::snapshot::{SnapshotCache, SnapshotKind};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML file with chains, contracts and tuning knobs
    #[arg(short, long, default_value = "airdrop.toml")]
    config: PathBuf,

    /// SQLite DB path (overrides `database` from the config file)
    #[arg(short, long)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring every configured contract up to the current head
    Index,
    /// Print holder balances at a block, or averaged over (start, end]
    Snapshot {
        #[arg(long)]
        chain: u64,
        #[arg(long)]
        contract: String,
        #[arg(long, conflicts_with_all = ["start", "end"])]
        block: Option<u64>,
        #[arg(long, requires = "end")]
        start: Option<u64>,
        #[arg(long, requires = "start")]
        end: Option<u64>,
        /// Recompute even if a cached file exists
        #[arg(long)]
        no_cache: bool,
    },
    /// Retry failed chunks, then airdrop over the blocks indexed since the last airdrop
    Airdrop {
        #[arg(long)]
        chain: u64,
        #[arg(long)]
        contract: String,
        /// Last block of the averaging window (default: indexed cursor)
        #[arg(long)]
        end_block: Option<u64>,
    },
    /// Reconcile pending chunks and resubmit failed ones
    Retry {
        #[arg(long)]
        chain: u64,
        #[arg(long)]
        contract: String,
    },
    /// Scheduled tick: index and airdrop when their intervals have elapsed
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    let db_path = cli.db_path.clone().unwrap_or_else(|| cfg.database.clone());
    let db = db::open_db(&db_path).with_context(|| format!("opening {}", db_path))?;

    match &cli.command {
        Commands::Index => {
            for result in indexer::index_all(&db, &cfg).await {
                let report = result?;
                for scan in &report.scanned {
                    println!(
                        "chain {} {:?}: {} new events, cursor {}",
                        report.chain_id, scan.contract, scan.events, scan.cursor
                    );
                }
                for (address, err) in &report.failed {
                    println!("chain {} {:?}: failed: {}", report.chain_id, address, err);
                }
            }
        }

        Commands::Snapshot {
            chain,
            contract,
            block,
            start,
            end,
            no_cache,
        } => {
            let kind = match (block, start, end) {
                (Some(block), None, None) => SnapshotKind::Instant { block: *block },
                (None, Some(start), Some(end)) => SnapshotKind::Average {
                    start: *start,
                    end: *end,
                },
                _ => return Err(anyhow!("pass either --block or both --start and --end")),
            };
            let contract = indexed_contract(&db, *chain, parse_address(contract)?)?;
            let cache = SnapshotCache::new(&cfg.snapshot_dir);
            let cache = if *no_cache { None } else { Some(&cache) };
            let balances = snapshot::take_snapshot(&db, cache, &contract, kind)?;
            print!("{}", snapshot::render_csv(&balances));
        }

        Commands::Airdrop {
            chain,
            contract,
            end_block,
        } => {
            let (chain_cfg, contract_cfg) = cfg.contract(*chain, parse_address(contract)?)?;
            let wallet = load_wallet()?;
            let rpc = EthersRpc::new(&chain_cfg.rpc_url, &cfg.rpc)?;
            let distributor = Distributor::new(
                &db,
                &rpc,
                wallet,
                chain_cfg.id,
                RetryPolicy::from(&cfg.rpc),
                &cfg.distribution,
            );
            let cache = SnapshotCache::new(&cfg.snapshot_dir);
            let outcome =
                scheduler::airdrop_contract(&db, &distributor, Some(&cache), chain_cfg, contract_cfg, *end_block)
                    .await?;
            print_outcome(&outcome);
        }

        Commands::Retry { chain, contract } => {
            let chain_cfg = cfg.chain(*chain)?;
            let contract = indexed_contract(&db, *chain, parse_address(contract)?)?;
            let rpc = EthersRpc::new(&chain_cfg.rpc_url, &cfg.rpc)?;
            let distributor = Distributor::new(
                &db,
                &rpc,
                load_wallet()?,
                chain_cfg.id,
                RetryPolicy::from(&cfg.rpc),
                &cfg.distribution,
            );
            let report = distributor.retry_failed(&contract).await?;
            println!("{:#?}", report);
        }

        Commands::Run => {
            let wallet = load_wallet()?;
            let summary = scheduler::run_scheduled(&db, &cfg, &wallet, Utc::now().timestamp()).await?;
            for (chain_id, address, outcome) in &summary.airdrops {
                print!("chain {} {:?}: ", chain_id, address);
                print_outcome(outcome);
            }
            for (chain_id, what, err) in &summary.failures {
                println!("chain {} {}: failed: {}", chain_id, what, err);
            }
        }
    }

    Ok(())
}

fn load_wallet() -> anyhow::Result<LocalWallet> {
    let key = env::var(PRIVATE_KEY_ENV).with_context(|| format!("{} is not set", PRIVATE_KEY_ENV))?;
    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| anyhow!("{} is not a valid private key: {}", PRIVATE_KEY_ENV, e))
}

fn indexed_contract(db: &rusqlite::Connection, chain_id: u64, address: Address) -> anyhow::Result<Contract> {
    db::find_contract(db, chain_id, address)?.ok_or_else(|| {
        anyhow!(error::Error::UnknownContract {
            chain_id,
            address: db::fmt_address(address),
        })
    })
}

fn print_outcome(outcome: &AirdropOutcome) {
    match outcome {
        AirdropOutcome::UpToDate { retry, cursor } => println!(
            "up to date at block {} ({} retried, {} exhausted)",
            cursor,
            retry.resubmitted.len(),
            retry.exhausted.len()
        ),
        AirdropOutcome::Distributed {
            retry,
            start,
            end,
            report,
        } => println!(
            "blocks ({}, {}]: {} of {} paid to {} holders in {} chunks ({} failed); {} retried, {} exhausted",
            start,
            end,
            report.paid,
            report.eligible,
            report.recipients,
            report.chunks.len(),
            report.failed(),
            retry.resubmitted.len(),
            retry.exhausted.len()
        ),
    }
}
