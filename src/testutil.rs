//! Scripted node used by the unit tests.

use crate::indexer::transfer_topic;
use crate::rpc::{ChainRpc, RetryPolicy, TxOutcome};
use async_trait::async_trait;
use ethers::providers::ProviderError;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// How a broadcast transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Success,
    Reverted,
    /// Rejected by the node; nothing reaches the mempool.
    SendError,
    /// Broadcast, then dropped: no receipt ever shows up.
    Dropped,
    /// Mined successfully but the receipt wait errors locally.
    MinedButWaitFails,
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        backoff: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
    }
}

pub fn test_wallet() -> LocalWallet {
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse::<LocalWallet>()
        .expect("test key")
}

/// `Transfer(from, to, value)` emitted by the token `repeat_byte(token)`.
pub fn transfer_log(token: u8, from: u8, to: u8, value: u64, block: u64, log_index: u64) -> Log {
    let mut data = [0u8; 32];
    U256::from(value).to_big_endian(&mut data);
    Log {
        address: Address::repeat_byte(token),
        topics: vec![
            transfer_topic(),
            H256::from(Address::repeat_byte(from)),
            H256::from(Address::repeat_byte(to)),
        ],
        data: Bytes::from(data.to_vec()),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(H256::from_low_u64_be(block * 1_000 + log_index + 1)),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct MockRpc {
    head: Mutex<u64>,
    logs: Mutex<Vec<Log>>,
    fail_logs_from: Mutex<Option<u64>>,
    log_queries: Mutex<Vec<(u64, u64)>>,
    balance: Mutex<U256>,
    nonce: Mutex<U256>,
    script: Mutex<VecDeque<Scripted>>,
    estimated: Mutex<Vec<TypedTransaction>>,
    mined: Mutex<HashMap<H256, TxOutcome>>,
    wait_fails: Mutex<HashSet<H256>>,
    sent: Mutex<Vec<H256>>,
    nonce_calls: Mutex<usize>,
    failing_nonce_calls: Mutex<HashSet<usize>>,
    receipts_down: Mutex<bool>,
}

impl MockRpc {
    pub fn with_head(head: u64) -> Self {
        let rpc = Self::default();
        *rpc.head.lock().unwrap() = head;
        rpc
    }

    pub fn with_wallet(balance: U256, nonce: u64) -> Self {
        let rpc = Self::default();
        *rpc.balance.lock().unwrap() = balance;
        *rpc.nonce.lock().unwrap() = U256::from(nonce);
        rpc
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn fail_logs_from(&self, block: u64) {
        *self.fail_logs_from.lock().unwrap() = Some(block);
    }

    pub fn clear_failures(&self) {
        *self.fail_logs_from.lock().unwrap() = None;
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.log_queries.lock().unwrap().clone()
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.lock().unwrap() = balance;
    }

    /// Outcomes for the next broadcasts, in order. Unscripted sends succeed.
    pub fn script(&self, outcomes: &[Scripted]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    /// Transactions handed to `estimate_gas`, i.e. every built payout.
    pub fn estimated(&self) -> Vec<TypedTransaction> {
        self.estimated.lock().unwrap().clone()
    }

    pub fn estimated_nonces(&self) -> Vec<U256> {
        self.estimated()
            .iter()
            .map(|tx| *tx.nonce().expect("nonce set"))
            .collect()
    }

    pub fn sent(&self) -> Vec<H256> {
        self.sent.lock().unwrap().clone()
    }

    /// Make the given `transaction_count` calls (0-based) fail.
    pub fn fail_nonce_calls(&self, calls: &[usize]) {
        self.failing_nonce_calls.lock().unwrap().extend(calls.iter().copied());
    }

    /// One-shot receipt lookups error while set.
    pub fn fail_receipts(&self, down: bool) {
        *self.receipts_down.lock().unwrap() = down;
    }

    pub fn mark_mined(&self, hash: H256, success: bool) {
        self.mined.lock().unwrap().insert(
            hash,
            TxOutcome {
                success,
                block_number: Some(1),
            },
        );
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(*self.head.lock().unwrap())
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ProviderError> {
        self.log_queries.lock().unwrap().push((from_block, to_block));
        if let Some(fail) = *self.fail_logs_from.lock().unwrap() {
            if from_block >= fail {
                return Err(ProviderError::CustomError("connection reset".into()));
            }
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.address == address && log.topics.first() == Some(&topic0))
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
                block >= from_block && block <= to_block
            })
            .cloned()
            .collect())
    }

    async fn token_balance(&self, _token: Address, _holder: Address) -> Result<U256, ProviderError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn gas_price(&self) -> Result<U256, ProviderError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn transaction_count(&self, _address: Address) -> Result<U256, ProviderError> {
        let call = {
            let mut calls = self.nonce_calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        if self.failing_nonce_calls.lock().unwrap().contains(&call) {
            return Err(ProviderError::CustomError("connection reset".into()));
        }
        Ok(*self.nonce.lock().unwrap())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ProviderError> {
        self.estimated.lock().unwrap().push(tx.clone());
        Ok(U256::from(50_000 + 30_000 * 100))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Scripted::Success);
        if outcome == Scripted::SendError {
            return Err(ProviderError::CustomError("insufficient funds for gas".into()));
        }
        let hash = H256::from(keccak256(&raw));
        self.sent.lock().unwrap().push(hash);
        match outcome {
            Scripted::Success => self.mark_mined(hash, true),
            Scripted::Reverted => self.mark_mined(hash, false),
            Scripted::MinedButWaitFails => {
                self.mark_mined(hash, true);
                self.wait_fails.lock().unwrap().insert(hash);
            }
            Scripted::Dropped | Scripted::SendError => {}
        }
        if outcome != Scripted::Dropped {
            *self.nonce.lock().unwrap() += U256::one();
        }
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: H256) -> Result<TxOutcome, ProviderError> {
        if self.wait_fails.lock().unwrap().contains(&hash) {
            return Err(ProviderError::CustomError("receipt poll timed out".into()));
        }
        self.mined
            .lock()
            .unwrap()
            .get(&hash)
            .copied()
            .ok_or_else(|| ProviderError::CustomError(format!("no receipt for {:?}", hash)))
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TxOutcome>, ProviderError> {
        if *self.receipts_down.lock().unwrap() {
            return Err(ProviderError::CustomError("connection reset".into()));
        }
        Ok(self.mined.lock().unwrap().get(&hash).copied())
    }
}
