use crate::config::RpcSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, Filter, Log, TransactionRequest, H256, U256, U64};
use ethers::utils::id;
use std::future::Future;
use std::time::Duration;

/// Final state of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Everything the indexer and the distributor need from a chain node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> std::result::Result<u64, ProviderError>;

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> std::result::Result<Vec<Log>, ProviderError>;

    /// ERC-20 `balanceOf(holder)` on `token`.
    async fn token_balance(&self, token: Address, holder: Address) -> std::result::Result<U256, ProviderError>;

    async fn gas_price(&self) -> std::result::Result<U256, ProviderError>;

    /// Next usable nonce, counting transactions still in the mempool.
    async fn transaction_count(&self, address: Address) -> std::result::Result<U256, ProviderError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> std::result::Result<U256, ProviderError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> std::result::Result<H256, ProviderError>;

    /// Poll until the transaction is mined or the receipt timeout expires.
    async fn wait_for_receipt(&self, hash: H256) -> std::result::Result<TxOutcome, ProviderError>;

    /// One-shot lookup; `None` while the transaction is unknown or unmined.
    async fn receipt(&self, hash: H256) -> std::result::Result<Option<TxOutcome>, ProviderError>;
}

pub struct EthersRpc {
    provider: Provider<Http>,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl EthersRpc {
    pub fn new(url: &str, settings: &RpcSettings) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| Error::Config(format!("invalid rpc url {url}: {e}")))?
            .interval(settings.poll_interval());
        Ok(Self {
            provider,
            receipt_timeout: settings.receipt_timeout(),
            poll_interval: settings.poll_interval(),
        })
    }
}

#[async_trait]
impl ChainRpc for EthersRpc {
    async fn block_number(&self) -> std::result::Result<u64, ProviderError> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> std::result::Result<Vec<Log>, ProviderError> {
        let filter = Filter::new()
            .address(address)
            .topic0(topic0)
            .from_block(BlockNumber::Number(U64::from(from_block)))
            .to_block(BlockNumber::Number(U64::from(to_block)));
        self.provider.get_logs(&filter).await
    }

    async fn token_balance(&self, token: Address, holder: Address) -> std::result::Result<U256, ProviderError> {
        let mut data = id("balanceOf(address)").to_vec();
        data.extend(abi::encode(&[Token::Address(holder)]));
        let call: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let out = self.provider.call(&call, None).await?;
        if out.len() < 32 {
            return Err(ProviderError::CustomError(format!(
                "balanceOf on {:?} returned {} bytes",
                token,
                out.len()
            )));
        }
        Ok(U256::from_big_endian(&out[..32]))
    }

    async fn gas_price(&self) -> std::result::Result<U256, ProviderError> {
        self.provider.get_gas_price().await
    }

    async fn transaction_count(&self, address: Address) -> std::result::Result<U256, ProviderError> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> std::result::Result<U256, ProviderError> {
        self.provider.estimate_gas(tx, None).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> std::result::Result<H256, ProviderError> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }

    async fn wait_for_receipt(&self, hash: H256) -> std::result::Result<TxOutcome, ProviderError> {
        let poll = async {
            loop {
                if let Some(outcome) = self.receipt(hash).await? {
                    return Ok(outcome);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.receipt_timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::CustomError(format!(
                "no receipt for {:?} after {}s",
                hash,
                self.receipt_timeout.as_secs()
            ))),
        }
    }

    async fn receipt(&self, hash: H256) -> std::result::Result<Option<TxOutcome>, ProviderError> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|r| TxOutcome {
            success: r.status == Some(U64::from(1)),
            block_number: r.block_number.map(|b| b.as_u64()),
        }))
    }
}

/// Bounded retry for idempotent reads against the node.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl From<&RpcSettings> for RetryPolicy {
    fn from(settings: &RpcSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: settings.backoff(),
            timeout: settings.timeout(),
        }
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        let err = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => Error::Rpc(e),
            Err(_) => Error::RpcTimeout {
                op: op.to_string(),
                secs: policy.timeout.as_secs(),
            },
        };
        if attempt >= policy.max_attempts {
            return Err(err);
        }
        log::warn!("{} failed (attempt {}/{}): {}", op, attempt, policy.max_attempts, err);
        tokio::time::sleep(policy.backoff * attempt).await;
        attempt += 1;
    }
}
