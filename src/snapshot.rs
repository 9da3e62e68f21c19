use crate::db;
use crate::error::{Error, Result};
use crate::models::{Contract, TransferRecord};
use ethers::types::{Address, I256, U256};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

/// Holder → balance, positive entries only.
pub type Balances = BTreeMap<Address, U256>;

/// Which balances to derive from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Balances after every event up to and including `block`.
    Instant { block: u64 },
    /// Block-weighted average over `(start, end]`: each block in the range
    /// contributes the balance held after that block's events.
    Average { start: u64, end: u64 },
}

impl SnapshotKind {
    pub fn validate(&self) -> Result<()> {
        match *self {
            SnapshotKind::Average { start, end } if end <= start => Err(Error::InvalidRange { start, end }),
            _ => Ok(()),
        }
    }

    /// Last block whose events the snapshot reads.
    pub fn upper_block(&self) -> u64 {
        match *self {
            SnapshotKind::Instant { block } => block,
            SnapshotKind::Average { end, .. } => end,
        }
    }

    fn file_name(&self) -> String {
        match *self {
            SnapshotKind::Instant { block } => format!("single_snapshot_{block}.csv"),
            SnapshotKind::Average { start, end } => format!("average_snapshot_{start}_{end}.csv"),
        }
    }
}

/// Replay `events` (in ledger order) up to `up_to`, keeping every entry,
/// including the negative balance of the mint address.
pub fn replay(events: &[TransferRecord], up_to: u64) -> Result<HashMap<Address, I256>> {
    let mut balances = HashMap::new();
    for rec in events.iter().take_while(|e| e.block_number <= up_to) {
        apply(&mut balances, rec)?;
    }
    Ok(balances)
}

fn apply(balances: &mut HashMap<Address, I256>, rec: &TransferRecord) -> Result<()> {
    if rec.value.bit(255) {
        return Err(Error::Overflow("transfer value"));
    }
    let value = I256::from_raw(rec.value);
    let from = balances.entry(rec.from_addr).or_insert_with(I256::zero);
    *from = from.checked_sub(value).ok_or(Error::Overflow("balance replay"))?;
    let to = balances.entry(rec.to_addr).or_insert_with(I256::zero);
    *to = to.checked_add(value).ok_or(Error::Overflow("balance replay"))?;
    Ok(())
}

/// Derive the balances `kind` asks for from events sorted by
/// (block, log index).
pub fn compute(events: &[TransferRecord], kind: SnapshotKind) -> Result<Balances> {
    kind.validate()?;
    match kind {
        SnapshotKind::Instant { block } => positive(replay(events, block)?),
        SnapshotKind::Average { start, end } => average(events, start, end),
    }
}

fn average(events: &[TransferRecord], start: u64, end: u64) -> Result<Balances> {
    let split = events.partition_point(|e| e.block_number <= start);
    let mut balances = replay(&events[..split], start)?;

    // A balance counts for every block from `since` until the block of its
    // next change; accruing at each change equals summing per block.
    let mut since: HashMap<Address, u64> = HashMap::new();
    let mut totals: HashMap<Address, I256> = HashMap::new();
    let mut accrue = |balances: &HashMap<Address, I256>, addr: Address, until: u64| -> Result<()> {
        let from = since.insert(addr, until).unwrap_or(start + 1);
        let balance = balances.get(&addr).copied().unwrap_or_else(I256::zero);
        let weighted = balance
            .checked_mul(span(until - from))
            .ok_or(Error::Overflow("average accumulation"))?;
        let total = totals.entry(addr).or_insert_with(I256::zero);
        *total = total.checked_add(weighted).ok_or(Error::Overflow("average accumulation"))?;
        Ok(())
    };

    for rec in events[split..].iter().take_while(|e| e.block_number <= end) {
        accrue(&balances, rec.from_addr, rec.block_number)?;
        accrue(&balances, rec.to_addr, rec.block_number)?;
        apply(&mut balances, rec)?;
    }
    let holders: Vec<Address> = balances.keys().copied().collect();
    for addr in holders {
        accrue(&balances, addr, end + 1)?;
    }

    let num_blocks = span(end - start);
    let averages = totals
        .into_iter()
        .filter(|(_, total)| total.is_positive())
        .map(|(addr, total)| Ok((addr, total.checked_div(num_blocks).ok_or(Error::Overflow("average"))?)))
        .collect::<Result<HashMap<_, _>>>()?;
    positive(averages)
}

fn span(blocks: u64) -> I256 {
    I256::from_raw(U256::from(blocks))
}

fn positive(balances: HashMap<Address, I256>) -> Result<Balances> {
    Ok(balances
        .into_iter()
        .filter(|(_, balance)| balance.is_positive())
        .map(|(addr, balance)| (addr, balance.into_raw()))
        .collect())
}

/// Snapshot results stored as `Address,Balance` CSV files, one per
/// (chain, contract, kind, range).
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    root: PathBuf,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, chain_id: u64, contract: Address, kind: SnapshotKind) -> PathBuf {
        self.root
            .join(chain_id.to_string())
            .join(db::fmt_address(contract))
            .join(kind.file_name())
    }

    pub fn read(&self, chain_id: u64, contract: Address, kind: SnapshotKind) -> Result<Option<Balances>> {
        let path = self.path(chain_id, contract, kind);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Cache { path, source }),
        };
        parse_csv(&raw).map(Some).map_err(|source| Error::Cache { path, source })
    }

    /// Write through a temp file so a crash never leaves a truncated cache
    /// entry that would later be trusted.
    pub fn write(&self, chain_id: u64, contract: Address, kind: SnapshotKind, balances: &Balances) -> Result<PathBuf> {
        let path = self.path(chain_id, contract, kind);
        let cache_err = |source: io::Error| Error::Cache { path: path.clone(), source };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(cache_err)?;
        }
        let tmp = path.with_extension("csv.tmp");
        fs::write(&tmp, render_csv(balances)).map_err(cache_err)?;
        fs::rename(&tmp, &path).map_err(cache_err)?;
        Ok(path)
    }
}

/// Largest balance first, ties by address.
pub fn render_csv(balances: &Balances) -> String {
    let mut rows: Vec<(&Address, &U256)> = balances.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    let mut out = String::from("Address,Balance\n");
    for (holder, balance) in rows {
        out.push_str(&format!("{:?},{}\n", holder, balance));
    }
    out
}

fn parse_csv(raw: &str) -> io::Result<Balances> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
    let mut balances = Balances::new();
    for (n, line) in raw.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let (holder, balance) = line
            .split_once(',')
            .ok_or_else(|| invalid(format!("line {}: expected `address,balance`", n + 1)))?;
        let holder = Address::from_str(holder.trim()).map_err(|e| invalid(format!("line {}: {e}", n + 1)))?;
        let balance = U256::from_dec_str(balance.trim()).map_err(|e| invalid(format!("line {}: {e}", n + 1)))?;
        balances.insert(holder, balance);
    }
    Ok(balances)
}

/// Compute (or load from cache) one snapshot of a contract's ledger.
///
/// The range is validated before anything is read, and a range beyond the
/// indexed cursor is refused so an incomplete result never gets cached.
pub fn take_snapshot(
    conn: &Connection,
    cache: Option<&SnapshotCache>,
    contract: &Contract,
    kind: SnapshotKind,
) -> Result<Balances> {
    kind.validate()?;
    // a cursor of -1 means nothing is indexed yet
    let indexed = u64::try_from(contract.last_processed_block).ok();
    if indexed.map_or(true, |cursor| kind.upper_block() > cursor) {
        return Err(Error::BeyondCursor {
            block: kind.upper_block(),
            cursor: contract.last_processed_block,
        });
    }

    if let Some(cache) = cache {
        if let Some(hit) = cache.read(contract.chain_id, contract.address, kind)? {
            log::info!(
                "{:?} snapshot already exists in {}",
                kind,
                cache.path(contract.chain_id, contract.address, kind).display()
            );
            return Ok(hit);
        }
    }

    let events = db::load_events(conn, contract.id, kind.upper_block())?;
    log::info!("Replaying {} events for {:?} ({:?})", events.len(), contract.address, kind);
    let balances = compute(&events, kind)?;

    if let Some(cache) = cache {
        let path = cache.write(contract.chain_id, contract.address, kind, &balances)?;
        log::info!("Snapshot has been written to {}", path.display());
    }
    Ok(balances)
}
