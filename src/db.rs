use rusqlite::{params, Connection, OptionalExtension, Row};
use crate::error::{Error, Result};
use crate::models::{ChunkStatus, Contract, PayoutChunk, TransferRecord};
use chrono::Utc;
use ethers::types::{Address, H256, U256};
use std::str::FromStr;
use std::time::Duration;

/// Open or create the SQLite ledger at path (":memory:" works for tests)
pub fn open_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(include_str!("../sql/schema.sql"))?;
    Ok(conn)
}

pub fn upsert_chain(conn: &Connection, id: u64, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO chains (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
        params![to_sql(id, "chain id")?, name],
    )?;
    Ok(())
}

/// Register a contract on first sight with its cursor at `start_block - 1`;
/// an existing row (and its cursor) is returned untouched.
pub fn ensure_contract(
    conn: &Connection,
    chain_id: u64,
    address: Address,
    name: Option<&str>,
    start_block: u64,
) -> Result<Contract> {
    let cursor = to_sql(start_block, "start block")? - 1;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO contracts (chain_id, address, name, last_processed_block)
        VALUES (?1, ?2, ?3, ?4)",
        params![to_sql(chain_id, "chain id")?, fmt_address(address), name, cursor],
    )?;
    if inserted > 0 {
        log::info!("Adding new contract {:?} on chain {} (start block {})", address, chain_id, start_block);
    }
    find_contract(conn, chain_id, address)?.ok_or_else(|| Error::UnknownContract {
        chain_id,
        address: fmt_address(address),
    })
}

pub fn find_contract(conn: &Connection, chain_id: u64, address: Address) -> Result<Option<Contract>> {
    let contract = conn
        .query_row(
            "SELECT id, chain_id, address, name, last_processed_block, last_airdropped_block
            FROM contracts WHERE chain_id = ?1 AND address = ?2",
            params![to_sql(chain_id, "chain id")?, fmt_address(address)],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                ))
            },
        )
        .optional()?;

    contract
        .map(|(id, chain_id, address, name, last_processed_block, last_airdropped_block)| {
            Ok(Contract {
                id,
                chain_id: from_sql(chain_id, "chain id")?,
                address: parse_address(&address)?,
                name,
                last_processed_block,
                last_airdropped_block: last_airdropped_block
                    .map(|b| from_sql(b, "last airdropped block"))
                    .transpose()?,
            })
        })
        .transpose()
}

/// Store one scanned window and move the cursor to `end_block` in a single
/// transaction. Re-delivered logs are ignored through the
/// (contract, tx hash, log index) unique key. Returns the number of new rows.
pub fn commit_window(conn: &Connection, contract_id: i64, events: &[TransferRecord], end_block: u64) -> Result<usize> {
    let end_block = to_sql(end_block, "block")?;
    let tx = conn.unchecked_transaction()?;
    let processed_at = Utc::now().timestamp();
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO transfer_events
            (contract_id, from_address, to_address, value, block_number, transaction_hash, log_index, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for rec in events {
            inserted += stmt.execute(params![
                contract_id,
                fmt_address(rec.from_addr),
                fmt_address(rec.to_addr),
                rec.value.to_string(),
                to_sql(rec.block_number, "block")?,
                fmt_hash(rec.tx_hash),
                to_sql(rec.log_index, "log index")?,
                processed_at,
            ])?;
        }
    }
    // never moves backwards
    tx.execute(
        "UPDATE contracts SET last_processed_block = ?2 WHERE id = ?1 AND last_processed_block < ?2",
        params![contract_id, end_block],
    )?;
    tx.commit()?;
    Ok(inserted)
}

/// All events of a contract up to and including `up_to_block`, in replay order.
pub fn load_events(conn: &Connection, contract_id: i64, up_to_block: u64) -> Result<Vec<TransferRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT transaction_hash, block_number, log_index, from_address, to_address, value
        FROM transfer_events
        WHERE contract_id = ?1 AND block_number <= ?2
        ORDER BY block_number, log_index, id",
    )?;
    let rows = stmt.query_map(params![contract_id, to_sql(up_to_block, "block")?], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (tx_hash, block_number, log_index, from, to, value) = row?;
        events.push(TransferRecord {
            tx_hash: parse_hash(&tx_hash)?,
            block_number: from_sql(block_number, "block")?,
            log_index: from_sql(log_index, "log index")?,
            from_addr: parse_address(&from)?,
            to_addr: parse_address(&to)?,
            value: parse_amount(&value)?,
        });
    }
    Ok(events)
}

pub fn set_last_airdropped_block(conn: &Connection, contract_id: i64, block: u64) -> Result<()> {
    conn.execute(
        "UPDATE contracts SET last_airdropped_block = ?2 WHERE id = ?1",
        params![contract_id, to_sql(block, "block")?],
    )?;
    Ok(())
}

// ---------------- payout ledger ----------------

pub fn insert_chunk(conn: &Connection, chunk: &PayoutChunk) -> Result<()> {
    let now = Utc::now().timestamp();
    let addresses: Vec<String> = chunk.addresses.iter().map(|a| fmt_address(*a)).collect();
    let amounts: Vec<String> = chunk.amounts.iter().map(|a| a.to_string()).collect();
    conn.execute(
        "INSERT INTO payout_chunks
        (chunk_id, contract_id, status, addresses, amounts, transaction_hash, nonce, retry_count, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            chunk.id,
            chunk.contract_id,
            chunk.status.as_str(),
            encode_json(&addresses)?,
            encode_json(&amounts)?,
            chunk.transaction_hash.map(fmt_hash),
            chunk.nonce.map(|n| n.to_string()),
            chunk.retry_count,
            now,
        ],
    )?;
    Ok(())
}

/// Remember what was broadcast before waiting on the receipt, so an
/// interrupted run can be reconciled against the chain.
pub fn record_broadcast(conn: &Connection, chunk_id: &str, tx_hash: H256, nonce: U256) -> Result<()> {
    conn.execute(
        "UPDATE payout_chunks SET transaction_hash = ?2, nonce = ?3, updated_at = ?4 WHERE chunk_id = ?1",
        params![chunk_id, fmt_hash(tx_hash), nonce.to_string(), Utc::now().timestamp()],
    )?;
    Ok(())
}

pub fn set_chunk_status(conn: &Connection, chunk_id: &str, status: ChunkStatus) -> Result<()> {
    conn.execute(
        "UPDATE payout_chunks SET status = ?2, updated_at = ?3 WHERE chunk_id = ?1",
        params![chunk_id, status.as_str(), Utc::now().timestamp()],
    )?;
    Ok(())
}

/// Move a failed chunk back to pending for one more attempt and bump its
/// retry counter. Returns the new count.
pub fn begin_retry(conn: &Connection, chunk_id: &str) -> Result<u32> {
    let count = conn.query_row(
        "UPDATE payout_chunks
        SET status = 'pending', retry_count = retry_count + 1, updated_at = ?2
        WHERE chunk_id = ?1 AND status = 'failed'
        RETURNING retry_count",
        params![chunk_id, Utc::now().timestamp()],
        |r| r.get::<_, u32>(0),
    )?;
    Ok(count)
}

pub fn get_chunk(conn: &Connection, chunk_id: &str) -> Result<Option<PayoutChunk>> {
    let mut stmt = conn.prepare_cached(&format!("{CHUNK_COLUMNS} WHERE chunk_id = ?1"))?;
    let row = stmt.query_row(params![chunk_id], raw_chunk).optional()?;
    row.map(chunk_from_raw).transpose()
}

/// Chunks of a contract in a given status, oldest first.
pub fn chunks_with_status(conn: &Connection, contract_id: i64, status: ChunkStatus) -> Result<Vec<PayoutChunk>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{CHUNK_COLUMNS} WHERE contract_id = ?1 AND status = ?2 ORDER BY seq"
    ))?;
    let rows = stmt.query_map(params![contract_id, status.as_str()], raw_chunk)?;
    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(chunk_from_raw(row?)?);
    }
    Ok(chunks)
}

/// Sum of all amounts still tied up in failed chunks of a contract.
pub fn failed_total(conn: &Connection, contract_id: i64) -> Result<U256> {
    chunks_with_status(conn, contract_id, ChunkStatus::Failed)?
        .iter()
        .try_fold(U256::zero(), |acc, chunk| {
            acc.checked_add(chunk.total()).ok_or(Error::Overflow("failed chunk total"))
        })
}

// ---------------- run state ----------------

/// (last index pass, last airdrop pass) as unix timestamps.
pub fn load_run_state(conn: &Connection) -> Result<(Option<i64>, Option<i64>)> {
    let row = conn
        .query_row(
            "SELECT last_index_run, last_airdrop_run FROM run_state WHERE id = 1",
            [],
            |r| Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, Option<i64>>(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((None, None)))
}

pub fn save_run_state(conn: &Connection, last_index_run: Option<i64>, last_airdrop_run: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT INTO run_state (id, last_index_run, last_airdrop_run) VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET last_index_run = ?1, last_airdrop_run = ?2",
        params![last_index_run, last_airdrop_run],
    )?;
    Ok(())
}

// ---------------- helpers ----------------

const CHUNK_COLUMNS: &str = "SELECT chunk_id, contract_id, status, addresses, amounts, transaction_hash, nonce, retry_count
    FROM payout_chunks";

type RawChunk = (String, i64, String, String, String, Option<String>, Option<String>, u32);

fn raw_chunk(r: &Row<'_>) -> rusqlite::Result<RawChunk> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn chunk_from_raw(raw: RawChunk) -> Result<PayoutChunk> {
    let (id, contract_id, status, addresses, amounts, tx_hash, nonce, retry_count) = raw;
    let status = ChunkStatus::from_db(&status)
        .ok_or_else(|| Error::Corrupt(format!("chunk {id} has unknown status `{status}`")))?;
    let addresses: Vec<String> = decode_json(&addresses)?;
    let amounts: Vec<String> = decode_json(&amounts)?;
    if addresses.len() != amounts.len() {
        return Err(Error::Corrupt(format!("chunk {id} has {} addresses but {} amounts", addresses.len(), amounts.len())));
    }
    Ok(PayoutChunk {
        contract_id,
        status,
        addresses: addresses.iter().map(|a| parse_address(a)).collect::<Result<_>>()?,
        amounts: amounts.iter().map(|a| parse_amount(a)).collect::<Result<_>>()?,
        transaction_hash: tx_hash.as_deref().map(parse_hash).transpose()?,
        nonce: nonce.as_deref().map(parse_amount).transpose()?,
        retry_count,
        id,
    })
}

/// Block numbers, chain ids and log indexes are stored as SQLite integers.
fn to_sql(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::OutOfRange { what, value })
}

fn from_sql(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Corrupt(format!("negative {what} {value}")))
}

pub fn fmt_address(address: Address) -> String {
    format!("{:?}", address)
}

fn fmt_hash(hash: H256) -> String {
    format!("{:?}", hash)
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| Error::Corrupt(format!("address `{s}`: {e}")))
}

fn parse_hash(s: &str) -> Result<H256> {
    H256::from_str(s).map_err(|e| Error::Corrupt(format!("hash `{s}`: {e}")))
}

fn parse_amount(s: &str) -> Result<U256> {
    U256::from_dec_str(s).map_err(|e| Error::Corrupt(format!("amount `{s}`: {e}")))
}

fn encode_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).map_err(|e| Error::Corrupt(e.to_string()))
}

fn decode_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| Error::Corrupt(format!("json column: {e}")))
}
