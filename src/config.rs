use crate::error::{Error, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the distributing wallet's private key.
pub const PRIVATE_KEY_ENV: &str = "DISTRIBUTOR_PRIVATE_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub distribution: DistributionSettings,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            timeout_secs: 30,
            receipt_timeout_secs: 300,
            poll_interval_ms: 2_000,
        }
    }
}

impl RpcSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributionSettings {
    /// Recipients per airdrop transaction.
    pub chunk_size: usize,
    pub max_retries: u32,
    /// Minimum seconds between two scheduled airdrops (one week).
    pub schedule_interval_secs: i64,
    /// Minimum seconds between two scheduled indexing passes.
    pub index_interval_secs: i64,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_retries: 5,
            schedule_interval_secs: 604_800,
            index_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub rpc_url: String,
    /// Blocks per `eth_getLogs` window.
    pub chunk_size: u64,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub address: String,
    pub name: Option<String>,
    pub start_block: Option<u64>,
    #[serde(default)]
    pub excluded_addresses: Vec<String>,
}

impl ContractConfig {
    pub fn address(&self) -> Result<Address> {
        parse_address(&self.address)
    }

    pub fn excluded(&self) -> Result<Vec<Address>> {
        self.excluded_addresses.iter().map(|a| parse_address(a)).collect()
    }
}

fn default_database() -> String {
    "airdrop.db".into()
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.distribution.chunk_size == 0 {
            return Err(Error::Config("distribution.chunk_size must be > 0".into()));
        }
        if self.rpc.max_attempts == 0 {
            return Err(Error::Config("rpc.max_attempts must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id) {
                return Err(Error::Config(format!("chain {} is configured twice", chain.id)));
            }
            if chain.chunk_size == 0 {
                return Err(Error::Config(format!("chain {}: chunk_size must be > 0", chain.id)));
            }
            for contract in &chain.contracts {
                contract.address()?;
                contract.excluded()?;
            }
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Result<&ChainConfig> {
        self.chains
            .iter()
            .find(|c| c.id == chain_id)
            .ok_or(Error::UnknownChain(chain_id))
    }

    pub fn contract(&self, chain_id: u64, address: Address) -> Result<(&ChainConfig, &ContractConfig)> {
        let chain = self.chain(chain_id)?;
        let contract = chain
            .contracts
            .iter()
            .find(|c| c.address().map(|a| a == address).unwrap_or(false))
            .ok_or_else(|| Error::UnknownContract {
                chain_id,
                address: format!("{:?}", address),
            })?;
        Ok((chain, contract))
    }
}

pub fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim()).map_err(|e| Error::Config(format!("invalid address `{raw}`: {e}")))
}
