use crate::airdrop::{exclude, DistributionReport, Distributor, RetryReport};
use crate::config::{AppConfig, ChainConfig, ContractConfig};
use crate::db;
use crate::error::{Error, Result};
use crate::indexer::{self, ChainReport};
use crate::rpc::{ChainRpc, EthersRpc, RetryPolicy};
use crate::snapshot::{take_snapshot, SnapshotCache, SnapshotKind};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use rusqlite::Connection;

/// When the scheduled passes last ran, as unix timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub last_index_run: Option<i64>,
    pub last_airdrop_run: Option<i64>,
}

impl RunState {
    pub fn load(conn: &Connection) -> Result<Self> {
        let (last_index_run, last_airdrop_run) = db::load_run_state(conn)?;
        Ok(Self {
            last_index_run,
            last_airdrop_run,
        })
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        db::save_run_state(conn, self.last_index_run, self.last_airdrop_run)
    }

    pub fn index_due(&self, now: i64, interval_secs: i64) -> bool {
        is_due(self.last_index_run, now, interval_secs)
    }

    pub fn airdrop_due(&self, now: i64, interval_secs: i64) -> bool {
        is_due(self.last_airdrop_run, now, interval_secs)
    }
}

fn is_due(last: Option<i64>, now: i64, interval_secs: i64) -> bool {
    last.map_or(true, |t| now - t >= interval_secs)
}

#[derive(Debug)]
pub enum AirdropOutcome {
    /// No new blocks were indexed since the last airdrop.
    UpToDate { retry: RetryReport, cursor: i64 },
    Distributed {
        retry: RetryReport,
        start: u64,
        end: u64,
        report: DistributionReport,
    },
}

/// Retry pass, average snapshot since the last airdrop, payout, then move
/// the contract's airdrop marker to the end of the range.
///
/// `end_block` defaults to the indexed cursor.
pub async fn airdrop_contract<R: ChainRpc + ?Sized>(
    conn: &Connection,
    distributor: &Distributor<'_, R>,
    cache: Option<&SnapshotCache>,
    chain: &ChainConfig,
    contract_cfg: &ContractConfig,
    end_block: Option<u64>,
) -> Result<AirdropOutcome> {
    db::upsert_chain(conn, chain.id, &chain.name)?;
    let start_block = contract_cfg.start_block.unwrap_or(0);
    let contract = db::ensure_contract(
        conn,
        chain.id,
        contract_cfg.address()?,
        contract_cfg.name.as_deref(),
        start_block,
    )?;

    let retry = distributor.retry_failed(&contract).await?;
    if !retry.exhausted.is_empty() {
        log::warn!(
            "{:?}: {} chunks are out of retries",
            contract.address,
            retry.exhausted.len()
        );
    }

    let start = contract
        .last_airdropped_block
        .unwrap_or_else(|| start_block.saturating_sub(1));
    let end = match end_block {
        Some(end) => end,
        None if contract.last_processed_block < 0 => {
            return Ok(AirdropOutcome::UpToDate {
                retry,
                cursor: contract.last_processed_block,
            })
        }
        None => contract.last_processed_block as u64,
    };
    if end <= start {
        log::info!("{:?}: no new blocks since {}", contract.address, start);
        return Ok(AirdropOutcome::UpToDate {
            retry,
            cursor: contract.last_processed_block,
        });
    }

    log::info!(
        "Running snapshot and airdrop for {:?} on chain {} over ({}, {}]",
        contract.address, chain.id, start, end
    );
    let snapshot = take_snapshot(conn, cache, &contract, SnapshotKind::Average { start, end })?;
    let mut excluded = contract_cfg.excluded()?;
    excluded.push(distributor.address());
    let snapshot = exclude(snapshot, &excluded);

    let report = distributor.distribute(&contract, &snapshot).await?;
    db::set_last_airdropped_block(conn, contract.id, end)?;
    Ok(AirdropOutcome::Distributed {
        retry,
        start,
        end,
        report,
    })
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub indexed: Vec<ChainReport>,
    pub airdrops: Vec<(u64, Address, AirdropOutcome)>,
    pub failures: Vec<(u64, String, Error)>,
}

/// One scheduled tick: index if the last pass is stale, airdrop every
/// configured contract if the schedule interval has elapsed.
pub async fn run_scheduled(
    conn: &Connection,
    cfg: &AppConfig,
    wallet: &LocalWallet,
    now: i64,
) -> Result<RunSummary> {
    let mut state = RunState::load(conn)?;
    let mut summary = RunSummary::default();

    if state.index_due(now, cfg.distribution.index_interval_secs) {
        log::info!("Updating indexer...");
        for (chain, result) in cfg.chains.iter().zip(indexer::index_all(conn, cfg).await) {
            match result {
                Ok(report) => summary.indexed.push(report),
                Err(e) => {
                    log::error!("[chain {}] indexing failed: {}", chain.id, e);
                    summary.failures.push((chain.id, chain.name.clone(), e));
                }
            }
        }
        state.last_index_run = Some(now);
        state.save(conn)?;
    } else {
        log::info!("Indexer is up to date.");
    }

    if !state.airdrop_due(now, cfg.distribution.schedule_interval_secs) {
        log::info!("Airdrop is not scheduled yet.");
        return Ok(summary);
    }

    log::info!("Running snapshot and airdrop...");
    let cache = SnapshotCache::new(&cfg.snapshot_dir);
    let policy = RetryPolicy::from(&cfg.rpc);
    for chain in &cfg.chains {
        let rpc = match EthersRpc::new(&chain.rpc_url, &cfg.rpc) {
            Ok(rpc) => rpc,
            Err(e) => {
                log::error!("[chain {}] {}", chain.id, e);
                summary.failures.push((chain.id, chain.name.clone(), e));
                continue;
            }
        };
        let distributor = Distributor::new(conn, &rpc, wallet.clone(), chain.id, policy.clone(), &cfg.distribution);
        for contract_cfg in &chain.contracts {
            match airdrop_contract(conn, &distributor, Some(&cache), chain, contract_cfg, None).await {
                Ok(outcome) => {
                    summary
                        .airdrops
                        .push((chain.id, contract_cfg.address()?, outcome));
                }
                Err(e) => {
                    log::error!("[chain {}] airdrop for {} failed: {}", chain.id, contract_cfg.address, e);
                    summary.failures.push((chain.id, contract_cfg.address.clone(), e));
                }
            }
        }
    }

    state.last_airdrop_run = Some(now);
    state.save(conn)?;
    Ok(summary)
}
