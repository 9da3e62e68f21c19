use crate::config::DistributionSettings;
use crate::db;
use crate::error::{Error, Result};
use crate::models::{ChunkStatus, Contract, PayoutChunk};
use crate::rpc::{with_retry, ChainRpc, RetryPolicy};
use crate::snapshot::Balances;
use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256, U512};
use ethers::utils::id;
use rusqlite::Connection;
use std::collections::HashSet;
use uuid::Uuid;

/// Drop holders that must never receive a payout (pools, the distributor...).
pub fn exclude(mut snapshot: Balances, excluded: &[Address]) -> Balances {
    let excluded: HashSet<&Address> = excluded.iter().collect();
    snapshot.retain(|holder, _| !excluded.contains(holder));
    snapshot
}

/// Split `eligible` pro rata over the snapshot: each holder gets
/// `floor(balance * eligible / total)`. Holders whose share rounds down to
/// zero are left out. The sum never exceeds `eligible`.
pub fn compute_payouts(snapshot: &Balances, eligible: U256) -> Result<Vec<(Address, U256)>> {
    let total = snapshot
        .values()
        .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
        .ok_or(Error::Overflow("snapshot total"))?;
    if total.is_zero() {
        return Ok(Vec::new());
    }

    let mut payouts = Vec::with_capacity(snapshot.len());
    for (holder, balance) in snapshot {
        let share = balance.full_mul(eligible) / U512::from(total);
        let amount = U256::try_from(share).map_err(|_| Error::Overflow("payout amount"))?;
        if !amount.is_zero() {
            payouts.push((*holder, amount));
        }
    }
    Ok(payouts)
}

/// `airdrop(address[],uint256[])` calldata for one chunk.
pub fn airdrop_calldata(addresses: &[Address], amounts: &[U256]) -> Bytes {
    let mut data = id("airdrop(address[],uint256[])").to_vec();
    data.extend(abi::encode(&[
        Token::Array(addresses.iter().map(|a| Token::Address(*a)).collect()),
        Token::Array(amounts.iter().map(|a| Token::Uint(*a)).collect()),
    ]));
    Bytes::from(data)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub eligible: U256,
    pub recipients: usize,
    /// Chunk id and final status, in submission order.
    pub chunks: Vec<(String, ChunkStatus)>,
    pub paid: U256,
}

impl DistributionReport {
    pub fn failed(&self) -> usize {
        self.chunks.iter().filter(|(_, s)| *s == ChunkStatus::Failed).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Stale pending chunks settled from their receipt (or lack of one).
    pub reconciled: usize,
    /// Failed chunks whose original transaction turned out to be mined.
    pub recovered: Vec<String>,
    pub resubmitted: Vec<(String, ChunkStatus)>,
    /// Out of retries; left failed for an operator.
    pub exhausted: Vec<String>,
    /// Receipt lookup failed; retried on the next pass.
    pub skipped: Vec<String>,
}

/// Drives one distributing wallet on one chain. Chunks are submitted one at
/// a time; the nonce counter lives for a single `distribute` or
/// `retry_failed` call and starts from the node's pending count.
pub struct Distributor<'a, R: ChainRpc + ?Sized> {
    conn: &'a Connection,
    rpc: &'a R,
    wallet: LocalWallet,
    policy: RetryPolicy,
    chunk_size: usize,
    max_retries: u32,
}

impl<'a, R: ChainRpc + ?Sized> Distributor<'a, R> {
    pub fn new(
        conn: &'a Connection,
        rpc: &'a R,
        wallet: LocalWallet,
        chain_id: u64,
        policy: RetryPolicy,
        settings: &DistributionSettings,
    ) -> Self {
        Self {
            conn,
            rpc,
            wallet: wallet.with_chain_id(chain_id),
            policy,
            chunk_size: settings.chunk_size.max(1),
            max_retries: settings.max_retries,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Token balance of the wallet minus what failed chunks still owe.
    pub async fn eligible_balance(&self, contract: &Contract) -> Result<U256> {
        let owner = self.wallet.address();
        let balance = with_retry(&self.policy, "balanceOf", || {
            self.rpc.token_balance(contract.address, owner)
        })
        .await?;
        let owed = db::failed_total(self.conn, contract.id)?;
        if owed > balance {
            log::warn!(
                "{:?}: failed chunks owe {} but the wallet only holds {}; nothing is eligible",
                contract.address, owed, balance
            );
            return Ok(U256::zero());
        }
        Ok(balance - owed)
    }

    /// Pay the snapshot holders their share of the eligible balance.
    pub async fn distribute(&self, contract: &Contract, snapshot: &Balances) -> Result<DistributionReport> {
        let eligible = self.eligible_balance(contract).await?;
        let payouts = compute_payouts(snapshot, eligible)?;
        let mut report = DistributionReport {
            eligible,
            recipients: payouts.len(),
            ..Default::default()
        };
        if payouts.is_empty() {
            log::info!("{:?}: nothing to distribute (eligible {})", contract.address, eligible);
            return Ok(report);
        }

        let mut nonce = Some(self.pending_nonce().await?);
        for batch in payouts.chunks(self.chunk_size) {
            let chunk = PayoutChunk {
                id: Uuid::new_v4().to_string(),
                contract_id: contract.id,
                status: ChunkStatus::Pending,
                addresses: batch.iter().map(|(a, _)| *a).collect(),
                amounts: batch.iter().map(|(_, v)| *v).collect(),
                transaction_hash: None,
                nonce: None,
                retry_count: 0,
            };
            db::insert_chunk(self.conn, &chunk)?;
            log::info!("Sending to {} addresses (chunk {})", chunk.addresses.len(), chunk.id);

            let status = self.submit(contract, &chunk, &mut nonce).await?;
            if status == ChunkStatus::Success {
                report.paid = report.paid.saturating_add(chunk.total());
            }
            report.chunks.push((chunk.id, status));
        }

        log::info!(
            "{:?}: {} recipients in {} chunks, {} failed",
            contract.address,
            report.recipients,
            report.chunks.len(),
            report.failed()
        );
        Ok(report)
    }

    /// Settle chunks an interrupted run left pending, then resubmit failed
    /// chunks that still have retries left.
    pub async fn retry_failed(&self, contract: &Contract) -> Result<RetryReport> {
        let mut report = RetryReport::default();

        for chunk in db::chunks_with_status(self.conn, contract.id, ChunkStatus::Pending)? {
            let status = match chunk.transaction_hash {
                Some(hash) => match self.lookup(hash).await {
                    Ok(Some(true)) => ChunkStatus::Success,
                    Ok(_) => ChunkStatus::Failed,
                    Err(e) => {
                        log::warn!("Cannot check {:?} for pending chunk {}: {}", hash, chunk.id, e);
                        report.skipped.push(chunk.id);
                        continue;
                    }
                },
                None => ChunkStatus::Failed,
            };
            log::info!("Reconciled stale chunk {} as {}", chunk.id, status.as_str());
            db::set_chunk_status(self.conn, &chunk.id, status)?;
            report.reconciled += 1;
        }

        let mut nonce = None;
        for chunk in db::chunks_with_status(self.conn, contract.id, ChunkStatus::Failed)? {
            if chunk.retry_count >= self.max_retries {
                log::error!("Chunk {} failed after {} retries", chunk.id, chunk.retry_count);
                report.exhausted.push(chunk.id);
                continue;
            }

            // never pay twice: the last attempt may have landed after all
            if let Some(hash) = chunk.transaction_hash {
                match self.lookup(hash).await {
                    Ok(Some(true)) => {
                        log::info!("Chunk {} was mined in {:?}; marking success", chunk.id, hash);
                        db::set_chunk_status(self.conn, &chunk.id, ChunkStatus::Success)?;
                        report.recovered.push(chunk.id);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Cannot check {:?} for chunk {}: {}", hash, chunk.id, e);
                        report.skipped.push(chunk.id);
                        continue;
                    }
                }
            }

            let retry = db::begin_retry(self.conn, &chunk.id)?;
            log::info!("Retrying chunk {} (attempt {}/{})", chunk.id, retry, self.max_retries);
            let status = self.submit(contract, &chunk, &mut nonce).await?;
            report.resubmitted.push((chunk.id, status));
        }

        Ok(report)
    }

    /// Sign, broadcast and wait for one chunk, recording each step. Chain
    /// failures end in a `failed` chunk; only storage errors are returned.
    ///
    /// `nonce` is `None` when the next slot is unknown and must be read from
    /// the node before signing.
    async fn submit(&self, contract: &Contract, chunk: &PayoutChunk, nonce: &mut Option<U256>) -> Result<ChunkStatus> {
        let slot = match *nonce {
            Some(slot) => slot,
            None => match self.pending_nonce().await {
                Ok(slot) => *nonce.insert(slot),
                Err(e) => {
                    log::warn!("Cannot read the next nonce for chunk {}: {}", chunk.id, e);
                    db::set_chunk_status(self.conn, &chunk.id, ChunkStatus::Failed)?;
                    return Ok(ChunkStatus::Failed);
                }
            },
        };
        let raw = match self.sign_chunk(contract, chunk, slot).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Failed to build chunk {}: {}", chunk.id, e);
                db::set_chunk_status(self.conn, &chunk.id, ChunkStatus::Failed)?;
                return Ok(ChunkStatus::Failed);
            }
        };
        let hash = match self.rpc.send_raw_transaction(raw).await {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("Failed to send chunk {}: {}", chunk.id, e);
                db::set_chunk_status(self.conn, &chunk.id, ChunkStatus::Failed)?;
                return Ok(ChunkStatus::Failed);
            }
        };
        db::record_broadcast(self.conn, &chunk.id, hash, slot)?;

        let status = match self.rpc.wait_for_receipt(hash).await {
            Ok(outcome) => {
                // a reverted transaction still consumed its nonce
                *nonce = Some(slot + U256::one());
                if outcome.success {
                    log::info!("Chunk {} mined in block {:?}", chunk.id, outcome.block_number);
                    ChunkStatus::Success
                } else {
                    log::warn!("Chunk {} reverted in {:?}", chunk.id, hash);
                    ChunkStatus::Failed
                }
            }
            Err(e) => {
                log::warn!("No receipt for chunk {} ({:?}): {}", chunk.id, hash, e);
                // resynced from the node before the next chunk is signed
                *nonce = None;
                ChunkStatus::Failed
            }
        };
        db::set_chunk_status(self.conn, &chunk.id, status)?;
        Ok(status)
    }

    async fn sign_chunk(&self, contract: &Contract, chunk: &PayoutChunk, nonce: U256) -> Result<Bytes> {
        let gas_price = with_retry(&self.policy, "eth_gasPrice", || self.rpc.gas_price()).await?;
        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(contract.address)
            .data(airdrop_calldata(&chunk.addresses, &chunk.amounts))
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.wallet.chain_id())
            .into();
        let gas = with_retry(&self.policy, "eth_estimateGas", || self.rpc.estimate_gas(&tx)).await?;
        tx.set_gas(gas);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }

    async fn pending_nonce(&self) -> Result<U256> {
        let owner = self.wallet.address();
        with_retry(&self.policy, "eth_getTransactionCount", || self.rpc.transaction_count(owner)).await
    }

    /// `Some(success)` once mined, `None` while unknown.
    async fn lookup(&self, hash: H256) -> Result<Option<bool>> {
        let receipt = with_retry(&self.policy, "eth_getTransactionReceipt", || self.rpc.receipt(hash)).await?;
        Ok(receipt.map(|r| r.success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_policy, test_wallet, MockRpc, Scripted};

    const CHAIN: u64 = 137;

    fn holder(n: u32) -> Address {
        Address::from_low_u64_be(0x1000 + n as u64)
    }

    fn setup() -> (Connection, Contract) {
        let conn = db::open_db(":memory:").expect("db open");
        db::upsert_chain(&conn, CHAIN, "polygon").expect("chain");
        let contract = db::ensure_contract(&conn, CHAIN, Address::repeat_byte(0xaa), None, 0).expect("contract");
        (conn, contract)
    }

    fn settings(chunk_size: usize, max_retries: u32) -> DistributionSettings {
        DistributionSettings {
            chunk_size,
            max_retries,
            ..Default::default()
        }
    }

    fn distributor<'a>(conn: &'a Connection, rpc: &'a MockRpc, settings: &DistributionSettings) -> Distributor<'a, MockRpc> {
        Distributor::new(conn, rpc, test_wallet(), CHAIN, fast_policy(), settings)
    }

    fn holders(n: u32) -> Balances {
        (0..n).map(|i| (holder(i), U256::from(10))).collect()
    }

    fn statuses(report: &DistributionReport) -> Vec<ChunkStatus> {
        report.chunks.iter().map(|(_, s)| *s).collect()
    }

    fn stored(conn: &Connection, id: &str) -> PayoutChunk {
        db::get_chunk(conn, id).expect("load").expect("chunk exists")
    }

    #[test]
    fn payouts_are_pro_rata_and_floored() {
        let snapshot: Balances = [(holder(1), U256::from(30)), (holder(2), U256::from(70))].into();

        let exact = compute_payouts(&snapshot, U256::from(100)).expect("payouts");
        assert_eq!(exact, vec![(holder(1), U256::from(30)), (holder(2), U256::from(70))]);

        let floored = compute_payouts(&snapshot, U256::from(99)).expect("payouts");
        assert_eq!(floored, vec![(holder(1), U256::from(29)), (holder(2), U256::from(69))]);
    }

    #[test]
    fn payouts_survive_large_products() {
        let big = U256::MAX / 2;
        let snapshot: Balances = [(holder(1), big), (holder(2), big)].into();
        let payouts = compute_payouts(&snapshot, U256::MAX).expect("no overflow");
        let paid = payouts.iter().fold(U256::zero(), |acc, (_, v)| acc + *v);
        assert!(paid <= U256::MAX);
        assert_eq!(payouts[0].1, payouts[1].1);
    }

    #[test]
    fn empty_or_zero_snapshot_pays_nobody() {
        assert!(compute_payouts(&Balances::new(), U256::from(100)).expect("payouts").is_empty());
        let dust: Balances = [(holder(1), U256::from(1)), (holder(2), U256::from(1_000_000))].into();
        let payouts = compute_payouts(&dust, U256::from(10)).expect("payouts");
        assert_eq!(payouts, vec![(holder(2), U256::from(9))]);
    }

    #[test]
    fn excluded_addresses_are_removed() {
        let snapshot = holders(3);
        let kept = exclude(snapshot, &[holder(1), Address::repeat_byte(0x77)]);
        assert_eq!(kept.keys().copied().collect::<Vec<_>>(), vec![holder(0), holder(2)]);
    }

    #[test]
    fn calldata_starts_with_the_airdrop_selector() {
        let data = airdrop_calldata(&[holder(1)], &[U256::from(5)]);
        assert_eq!(&data[..4], &id("airdrop(address[],uint256[])")[..]);
        // selector, two offsets, then each array's length and single element
        assert_eq!(data.len(), 4 + 32 * 6);
    }

    #[tokio::test]
    async fn splits_holders_into_chunks_with_increasing_nonces() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(2_500), 7);
        let settings = settings(100, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(250))
            .await
            .expect("distribute");

        assert_eq!(report.recipients, 250);
        assert_eq!(statuses(&report), vec![ChunkStatus::Success; 3]);
        assert_eq!(report.paid, U256::from(2_500));
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(7), U256::from(8), U256::from(9)]);

        let sizes: Vec<usize> = report
            .chunks
            .iter()
            .map(|(id, _)| stored(&conn, id).addresses.len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let last = stored(&conn, &report.chunks[2].0);
        assert_eq!(last.nonce, Some(U256::from(9)));
        assert_eq!(last.transaction_hash, Some(rpc.sent()[2]));
    }

    #[tokio::test]
    async fn reverted_chunk_fails_and_run_continues_on_next_nonce() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(300), 0);
        rpc.script(&[Scripted::Success, Scripted::Reverted, Scripted::Success]);
        let settings = settings(1, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(3))
            .await
            .expect("distribute");

        assert_eq!(
            statuses(&report),
            vec![ChunkStatus::Success, ChunkStatus::Failed, ChunkStatus::Success]
        );
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(0), U256::from(1), U256::from(2)]);
        assert_eq!(report.paid, U256::from(200));
        let failed = stored(&conn, &report.chunks[1].0);
        assert_eq!(failed.status, ChunkStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.transaction_hash.is_some());
    }

    #[tokio::test]
    async fn rejected_broadcast_keeps_the_nonce_slot() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(200), 3);
        rpc.script(&[Scripted::SendError, Scripted::Success]);
        let settings = settings(1, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(2))
            .await
            .expect("distribute");

        assert_eq!(statuses(&report), vec![ChunkStatus::Failed, ChunkStatus::Success]);
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(3), U256::from(3)]);
        assert_eq!(stored(&conn, &report.chunks[0].0).transaction_hash, None);
    }

    #[tokio::test]
    async fn lost_receipt_resyncs_nonce_from_the_node() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(300), 0);
        rpc.script(&[Scripted::Dropped, Scripted::MinedButWaitFails, Scripted::Success]);
        let settings = settings(1, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(3))
            .await
            .expect("distribute");

        assert_eq!(
            statuses(&report),
            vec![ChunkStatus::Failed, ChunkStatus::Failed, ChunkStatus::Success]
        );
        // dropped: the slot is free again; mined: the node moved on
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(0), U256::from(0), U256::from(1)]);
        for (id, _) in &report.chunks {
            assert!(stored(&conn, id).transaction_hash.is_some());
        }
    }

    #[tokio::test]
    async fn eligible_balance_holds_back_failed_amounts() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(1_000), 0);
        rpc.script(&[Scripted::Reverted]);
        let settings = settings(100, 5);
        let distributor = distributor(&conn, &rpc, &settings);

        let snapshot: Balances = [(holder(1), U256::from(30)), (holder(2), U256::from(70))].into();
        let report = distributor.distribute(&contract, &snapshot).await.expect("distribute");
        assert_eq!(report.failed(), 1);

        // the reverted chunk's 1000 tokens are still in the wallet but owed
        assert_eq!(distributor.eligible_balance(&contract).await.expect("eligible"), U256::zero());
        rpc.set_balance(U256::from(1_500));
        assert_eq!(distributor.eligible_balance(&contract).await.expect("eligible"), U256::from(500));
        rpc.set_balance(U256::from(10));
        assert_eq!(distributor.eligible_balance(&contract).await.expect("eligible"), U256::zero());
    }

    #[tokio::test]
    async fn retry_resubmits_identical_payload_until_exhausted() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(100), 0);
        rpc.script(&[Scripted::Reverted, Scripted::Reverted, Scripted::Reverted]);
        let settings = settings(100, 2);
        let distributor = distributor(&conn, &rpc, &settings);
        let snapshot: Balances = [(holder(1), U256::from(30)), (holder(2), U256::from(70))].into();
        let report = distributor.distribute(&contract, &snapshot).await.expect("distribute");
        let id = report.chunks[0].0.clone();
        let original = stored(&conn, &id);

        let first = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(first.resubmitted, vec![(id.clone(), ChunkStatus::Failed)]);
        let second = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(second.resubmitted, vec![(id.clone(), ChunkStatus::Failed)]);
        let third = distributor.retry_failed(&contract).await.expect("retry");
        assert!(third.resubmitted.is_empty());
        assert_eq!(third.exhausted, vec![id.clone()]);

        let after = stored(&conn, &id);
        assert_eq!(after.retry_count, 2);
        assert_eq!(after.addresses, original.addresses);
        assert_eq!(after.amounts, original.amounts);

        let calls = rpc.estimated();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|tx| tx.data() == calls[0].data()));
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(0), U256::from(1), U256::from(2)]);
        assert_eq!(rpc.sent().len(), 3);
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(100), 0);
        rpc.script(&[Scripted::SendError]);
        let settings = settings(100, 5);
        let distributor = distributor(&conn, &rpc, &settings);
        let report = distributor.distribute(&contract, &holders(4)).await.expect("distribute");
        let id = report.chunks[0].0.clone();

        let retry = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(retry.resubmitted, vec![(id.clone(), ChunkStatus::Success)]);
        let chunk = stored(&conn, &id);
        assert_eq!(chunk.status, ChunkStatus::Success);
        assert_eq!(chunk.retry_count, 1);
        assert_eq!(db::failed_total(&conn, contract.id).expect("owed"), U256::zero());
    }

    #[tokio::test]
    async fn mined_original_is_not_paid_twice() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(100), 0);
        rpc.script(&[Scripted::MinedButWaitFails]);
        let settings = settings(100, 5);
        let distributor = distributor(&conn, &rpc, &settings);
        let report = distributor.distribute(&contract, &holders(2)).await.expect("distribute");
        let id = report.chunks[0].0.clone();
        assert_eq!(stored(&conn, &id).status, ChunkStatus::Failed);

        let retry = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(retry.recovered, vec![id.clone()]);
        assert!(retry.resubmitted.is_empty());
        assert_eq!(rpc.sent().len(), 1);
        let chunk = stored(&conn, &id);
        assert_eq!(chunk.status, ChunkStatus::Success);
        assert_eq!(chunk.retry_count, 0);
    }

    #[tokio::test]
    async fn stale_pending_chunks_are_reconciled() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(100), 5);
        let mined = H256::repeat_byte(0x11);
        rpc.mark_mined(mined, true);

        let pending = |id: &str, hash: Option<H256>| PayoutChunk {
            id: id.to_string(),
            contract_id: contract.id,
            status: ChunkStatus::Pending,
            addresses: vec![holder(1)],
            amounts: vec![U256::from(10)],
            transaction_hash: hash,
            nonce: hash.map(|_| U256::from(4)),
            retry_count: 0,
        };
        db::insert_chunk(&conn, &pending("landed", Some(mined))).expect("insert");
        db::insert_chunk(&conn, &pending("never-sent", None)).expect("insert");

        let settings = settings(100, 5);
        let report = distributor(&conn, &rpc, &settings)
            .retry_failed(&contract)
            .await
            .expect("retry");

        assert_eq!(report.reconciled, 2);
        assert_eq!(stored(&conn, "landed").status, ChunkStatus::Success);
        // the unsent chunk is failed by reconciliation, then retried in the same pass
        assert_eq!(report.resubmitted, vec![("never-sent".to_string(), ChunkStatus::Success)]);
        assert_eq!(stored(&conn, "never-sent").retry_count, 1);
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(5)]);
    }

    #[tokio::test]
    async fn failed_nonce_resync_fails_only_that_chunk() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(300), 0);
        rpc.script(&[Scripted::Dropped, Scripted::Success]);
        // call 0 starts the run; call 1 is the resync after the lost receipt
        rpc.fail_nonce_calls(&[1]);
        let settings = settings(1, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(3))
            .await
            .expect("distribute");

        assert_eq!(
            statuses(&report),
            vec![ChunkStatus::Failed, ChunkStatus::Failed, ChunkStatus::Success]
        );
        assert_eq!(rpc.estimated_nonces(), vec![U256::from(0), U256::from(0)]);
        assert_eq!(rpc.sent().len(), 2);
        assert_eq!(stored(&conn, &report.chunks[1].0).transaction_hash, None);
        assert!(db::chunks_with_status(&conn, contract.id, ChunkStatus::Pending)
            .expect("pending")
            .is_empty());
    }

    #[tokio::test]
    async fn receipt_lookup_errors_skip_chunks_without_resending() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::from(100), 0);
        let settings = settings(100, 5);
        let distributor = distributor(&conn, &rpc, &settings);

        rpc.script(&[Scripted::Reverted]);
        let report = distributor.distribute(&contract, &holders(2)).await.expect("distribute");
        let failed_id = report.chunks[0].0.clone();

        db::insert_chunk(
            &conn,
            &PayoutChunk {
                id: "in-flight".into(),
                contract_id: contract.id,
                status: ChunkStatus::Pending,
                addresses: vec![holder(1)],
                amounts: vec![U256::from(10)],
                transaction_hash: Some(H256::repeat_byte(0x22)),
                nonce: Some(U256::from(1)),
                retry_count: 0,
            },
        )
        .expect("insert");

        rpc.fail_receipts(true);
        let retry = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(retry.reconciled, 0);
        assert_eq!(retry.skipped, vec!["in-flight".to_string(), failed_id.clone()]);
        assert!(retry.resubmitted.is_empty());
        assert_eq!(rpc.sent().len(), 1);
        assert_eq!(stored(&conn, "in-flight").status, ChunkStatus::Pending);
        assert_eq!(stored(&conn, &failed_id).retry_count, 0);

        // back online: both are settled on the next pass
        rpc.fail_receipts(false);
        let retry = distributor.retry_failed(&contract).await.expect("retry");
        assert_eq!(retry.reconciled, 1);
        assert_eq!(stored(&conn, "in-flight").status, ChunkStatus::Failed);
        assert_eq!(retry.resubmitted.len(), 2);
    }

    #[tokio::test]
    async fn nothing_to_pay_sends_nothing() {
        let (conn, contract) = setup();
        let rpc = MockRpc::with_wallet(U256::zero(), 0);
        let settings = settings(100, 5);
        let report = distributor(&conn, &rpc, &settings)
            .distribute(&contract, &holders(10))
            .await
            .expect("distribute");
        assert_eq!(report.recipients, 0);
        assert!(report.chunks.is_empty());
        assert!(rpc.estimated().is_empty());
    }
}
