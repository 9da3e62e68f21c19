use crate::config::{AppConfig, ChainConfig, RpcSettings};
use crate::db;
use crate::error::{Error, Result};
use crate::models::{Contract, TransferRecord};
use crate::rpc::{with_retry, ChainRpc, EthersRpc, RetryPolicy};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use futures::future::join_all;
use rusqlite::Connection;

/// keccak("Transfer(address,address,uint256)")
pub fn transfer_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

/// Outcome of advancing one contract's cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub contract: Address,
    pub from_block: u64,
    pub head: u64,
    pub windows: usize,
    pub events: usize,
    pub cursor: i64,
}

#[derive(Debug)]
pub struct ChainReport {
    pub chain_id: u64,
    pub scanned: Vec<ScanReport>,
    pub failed: Vec<(Address, Error)>,
}

/// Decode one ERC-20 `Transfer` log. `window` is the block range the log was
/// requested for; anything outside it is treated as malformed.
pub fn decode_transfer_log(log: &Log, window: (u64, u64)) -> Result<TransferRecord> {
    let tx = log
        .transaction_hash
        .map(|h| format!("{:#x}", h))
        .unwrap_or_else(|| "<unknown_tx>".to_string());
    let malformed = |reason: String| Error::Decode { tx: tx.clone(), reason };

    // topics: [Transfer, from, to]; the amount lives in data
    if log.topics.len() != 3 {
        return Err(malformed(format!("expected 3 topics, got {}", log.topics.len())));
    }
    if log.topics[0] != transfer_topic() {
        return Err(malformed(format!("unexpected topic0 {:#x}", log.topics[0])));
    }
    if log.data.len() != 32 {
        return Err(malformed(format!("expected 32 data bytes, got {}", log.data.len())));
    }
    let tx_hash = log.transaction_hash.ok_or_else(|| malformed("missing transaction hash".into()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| malformed("missing block number".into()))?
        .as_u64();
    let log_index = log.log_index.ok_or_else(|| malformed("missing log index".into()))?;
    if log_index > U256::from(u64::MAX) {
        return Err(malformed(format!("log index {} out of range", log_index)));
    }
    if block_number < window.0 || block_number > window.1 {
        return Err(malformed(format!(
            "block {} outside requested window [{}, {}]",
            block_number, window.0, window.1
        )));
    }

    // indexed addresses are left-padded to 32 bytes
    Ok(TransferRecord {
        tx_hash,
        block_number,
        log_index: log_index.as_u64(),
        from_addr: Address::from_slice(&log.topics[1].as_bytes()[12..]),
        to_addr: Address::from_slice(&log.topics[2].as_bytes()[12..]),
        value: U256::from_big_endian(&log.data.0),
    })
}

/// Advance one contract's cursor to the head observed at the start of the
/// scan, one `chunk_size` window at a time. Each window is committed with its
/// cursor update; an error leaves the cursor at the last committed window.
pub async fn scan_contract<R: ChainRpc + ?Sized>(
    conn: &Connection,
    rpc: &R,
    policy: &RetryPolicy,
    contract: &Contract,
    chunk_size: u64,
) -> Result<ScanReport> {
    let topic = transfer_topic();
    // read once: blocks produced during the scan wait for the next pass
    let head = with_retry(policy, "eth_blockNumber", || rpc.block_number()).await?;
    let from_block = contract.next_block();
    let mut report = ScanReport {
        contract: contract.address,
        from_block,
        head,
        windows: 0,
        events: 0,
        cursor: contract.last_processed_block,
    };

    let mut start = from_block;
    while start <= head {
        let end = start.saturating_add(chunk_size - 1).min(head);
        log::info!("Getting events for {:?} from {} to {}", contract.address, start, end);

        let logs = with_retry(policy, "eth_getLogs", || rpc.get_logs(contract.address, topic, start, end)).await?;
        let events = logs
            .iter()
            .map(|log| decode_transfer_log(log, (start, end)))
            .collect::<Result<Vec<_>>>()?;

        let inserted = db::commit_window(conn, contract.id, &events, end)?;
        report.windows += 1;
        report.events += inserted;
        report.cursor = end as i64;
        start = end + 1;
    }

    Ok(report)
}

/// Scan every configured contract of one chain, sequentially. A contract
/// that fails is reported and the next one is still scanned.
pub async fn index_chain<R: ChainRpc + ?Sized>(
    conn: &Connection,
    rpc: &R,
    policy: &RetryPolicy,
    chain: &ChainConfig,
) -> Result<ChainReport> {
    db::upsert_chain(conn, chain.id, &chain.name)?;
    let mut report = ChainReport {
        chain_id: chain.id,
        scanned: Vec::new(),
        failed: Vec::new(),
    };

    for contract_cfg in &chain.contracts {
        let address = contract_cfg.address()?;
        let contract = db::ensure_contract(
            conn,
            chain.id,
            address,
            contract_cfg.name.as_deref(),
            contract_cfg.start_block.unwrap_or(0),
        )?;

        match scan_contract(conn, rpc, policy, &contract, chain.chunk_size).await {
            Ok(scan) => {
                log::info!(
                    "[chain {}] {:?} indexed to block {} ({} new events)",
                    chain.id, address, scan.cursor, scan.events
                );
                report.scanned.push(scan);
            }
            Err(e) => {
                log::error!("[chain {}] indexing {:?} stopped: {}", chain.id, address, e);
                report.failed.push((address, e));
            }
        }
    }

    Ok(report)
}

/// One indexing pass over every configured chain. Chains progress
/// concurrently; each has its own node connection.
pub async fn index_all(conn: &Connection, cfg: &AppConfig) -> Vec<Result<ChainReport>> {
    let policy = RetryPolicy::from(&cfg.rpc);
    let passes = cfg
        .chains
        .iter()
        .map(|chain| index_configured_chain(conn, &policy, &cfg.rpc, chain));
    join_all(passes).await
}

async fn index_configured_chain(
    conn: &Connection,
    policy: &RetryPolicy,
    settings: &RpcSettings,
    chain: &ChainConfig,
) -> Result<ChainReport> {
    let rpc = EthersRpc::new(&chain.rpc_url, settings)?;
    index_chain(conn, &rpc, policy, chain).await
}
