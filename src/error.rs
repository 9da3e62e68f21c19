use ethers::providers::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the indexer, snapshot and distribution engines.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or node failure. Transient: nothing was advanced.
    #[error("rpc error: {0}")]
    Rpc(#[from] ProviderError),

    #[error("rpc call {op} timed out after {secs}s")]
    RpcTimeout { op: String, secs: u64 },

    /// A log that is not a well-formed ERC-20 transfer. Fatal for its window.
    #[error("malformed transfer log in {tx}: {reason}")]
    Decode { tx: String, reason: String },

    #[error("invalid block range: end {end} must be greater than start {start}")]
    InvalidRange { start: u64, end: u64 },

    /// The ledger has not been indexed far enough to answer.
    #[error("block {block} is beyond the indexed cursor {cursor}")]
    BeyondCursor { block: u64, cursor: i64 },

    /// Larger than the store's signed 64-bit integers can hold.
    #[error("{what} {value} is out of range")]
    OutOfRange { what: &'static str, value: u64 },

    #[error("unknown chain {0}")]
    UnknownChain(u64),

    #[error("unknown contract {address} on chain {chain_id}")]
    UnknownContract { chain_id: u64, address: String },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("snapshot cache {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
