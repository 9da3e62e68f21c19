use ethers::types::{Address, H256, U256};

/// A decoded ERC-20 `Transfer` log, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub tx_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
    pub from_addr: Address,
    pub to_addr: Address,
    pub value: U256,
}

/// An indexed token contract and its resumable cursor.
///
/// `last_processed_block` starts at `start_block - 1`, so it is `-1` for a
/// contract indexed from genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub id: i64,
    pub chain_id: u64,
    pub address: Address,
    pub name: Option<String>,
    pub last_processed_block: i64,
    pub last_airdropped_block: Option<u64>,
}

impl Contract {
    /// First block the indexer has not scanned yet.
    pub fn next_block(&self) -> u64 {
        (self.last_processed_block + 1).max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Success,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Success => "success",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One airdrop batch. Addresses and amounts are fixed at creation and every
/// retry resends exactly this payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutChunk {
    pub id: String,
    pub contract_id: i64,
    pub status: ChunkStatus,
    pub addresses: Vec<Address>,
    pub amounts: Vec<U256>,
    pub transaction_hash: Option<H256>,
    pub nonce: Option<U256>,
    pub retry_count: u32,
}

impl PayoutChunk {
    pub fn total(&self) -> U256 {
        self.amounts
            .iter()
            .fold(U256::zero(), |acc, amount| acc.saturating_add(*amount))
    }
}
