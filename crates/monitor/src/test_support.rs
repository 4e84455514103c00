//! In-memory doubles for the ledger, the bus, the cursor and the clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chain_notify_domain::storage::{BlockCursor, CursorError, CursorResult};
use chain_notify_domain::{QualityOfService, TraceConfig, TransferTx};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Block, Bytes, Transaction, TransactionRequest, H256, U256, U64};

use crate::bus::{BusError, MessageBus};
use crate::rpc::{BlockHeader, BlockHeight, BlockSource, InternalTransfer, SourceError};
use crate::ticker::Clock;

pub const TEST_CHAIN_ID: u64 = 16888;

pub fn test_wallet() -> LocalWallet {
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse::<LocalWallet>()
        .expect("valid key")
        .with_chain_id(TEST_CHAIN_ID)
}

/// Signs `tx` with [`test_wallet`] and returns the `0x`-prefixed raw bytes
/// plus the resulting transaction hash.
pub fn sign_raw(tx: &TypedTransaction) -> (String, H256) {
    sign_raw_with(&test_wallet(), tx)
}

pub fn sign_raw_with(wallet: &LocalWallet, tx: &TypedTransaction) -> (String, H256) {
    let signature = wallet
        .sign_transaction_sync(tx)
        .expect("signing succeeds");
    let raw = tx.rlp_signed(&signature);
    (format!("0x{}", hex::encode(&raw)), tx.hash(&signature))
}

/// Legacy value transfer, or a contract creation when `to` is `None`.
pub fn signed_legacy(to: Option<Address>, value: u64) -> (String, H256) {
    let mut request = TransactionRequest::new()
        .value(value)
        .nonce(0u64)
        .gas(100_000u64)
        .gas_price(1u64)
        .chain_id(TEST_CHAIN_ID);
    if let Some(to) = to {
        request = request.to(to);
    }
    sign_raw(&request.into())
}

pub fn sample_transfer(to: Option<Address>, seed: u64) -> TransferTx {
    TransferTx {
        from: Address::repeat_byte(0xaa),
        to,
        value: U256::from(1000u64),
        hash: H256::from_low_u64_be(seed),
        data: Bytes::default(),
        block_number: None,
    }
}

pub fn sample_tx(seed: u64, to: Option<Address>) -> Transaction {
    Transaction {
        hash: H256::from_low_u64_be(seed),
        from: Address::repeat_byte(0xaa),
        to,
        value: U256::from(seed),
        input: Bytes::from(vec![seed as u8]),
        ..Default::default()
    }
}

pub fn block_with(number: u64, hashes: &[u64]) -> Block<Transaction> {
    Block {
        number: Some(U64::from(number)),
        hash: Some(H256::from_low_u64_be(number)),
        timestamp: U256::from(number),
        transactions: hashes
            .iter()
            .map(|seed| sample_tx(*seed, Some(Address::repeat_byte(0xbb))))
            .collect(),
        ..Default::default()
    }
}

/// Millisecond clock following tokio time plus an injectable skew, so paused
/// tests can simulate slow work without really sleeping.
pub struct TestClock {
    origin: tokio::time::Instant,
    base_ms: i64,
    skew_ms: AtomicI64,
}

impl TestClock {
    pub fn starting_at(base_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            base_ms,
            skew_ms: AtomicI64::new(0),
        })
    }

    pub fn skew(&self, ms: i64) {
        self.skew_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64 + self.skew_ms.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeChain {
    head: u64,
    period: u64,
    transactions: HashMap<u64, Vec<Transaction>>,
    senders: HashMap<H256, Result<Address, SourceError>>,
    traces: HashMap<H256, Result<Vec<InternalTransfer>, SourceError>>,
    slow_blocks: HashMap<u64, i64>,
    broken: Option<u64>,
    fetched: Vec<u64>,
}

/// Scripted ledger. Block `n` has timestamp `n * period`. With a clock
/// attached the head follows wall time instead of staying fixed.
pub struct FakeSource {
    chain: Mutex<FakeChain>,
    clock: Option<Arc<TestClock>>,
    trace_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(head: u64, period: u64) -> Self {
        Self {
            chain: Mutex::new(FakeChain {
                head,
                period,
                ..Default::default()
            }),
            clock: None,
            trace_calls: AtomicUsize::new(0),
        }
    }

    pub fn live(clock: Arc<TestClock>, period: u64) -> Self {
        let mut source = Self::new(0, period);
        source.clock = Some(clock);
        source
    }

    pub fn with_transactions(self, number: u64, txs: Vec<Transaction>) -> Self {
        self.chain.lock().unwrap().transactions.insert(number, txs);
        self
    }

    pub fn with_sender(self, hash: H256, sender: Result<Address, SourceError>) -> Self {
        self.chain.lock().unwrap().senders.insert(hash, sender);
        self
    }

    pub fn with_trace(self, hash: H256, trace: Result<Vec<InternalTransfer>, SourceError>) -> Self {
        self.chain.lock().unwrap().traces.insert(hash, trace);
        self
    }

    /// Fetching block `number` pushes the clock forward by `delay_ms`.
    pub fn with_slow_block(self, number: u64, delay_ms: i64) -> Self {
        self.chain.lock().unwrap().slow_blocks.insert(number, delay_ms);
        self
    }

    /// Every block fetch of `number` fails with a non-transient error.
    pub fn with_broken_block(self, number: u64) -> Self {
        self.chain.lock().unwrap().broken = Some(number);
        self
    }

    pub fn set_head(&self, head: u64) {
        self.chain.lock().unwrap().head = head;
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.chain.lock().unwrap().fetched.clone()
    }

    pub fn trace_calls(&self) -> usize {
        self.trace_calls.load(Ordering::SeqCst)
    }

    fn head(&self, chain: &FakeChain) -> u64 {
        match &self.clock {
            Some(clock) if chain.period > 0 => {
                (clock.now_millis() / 1000) as u64 / chain.period
            }
            _ => chain.head,
        }
    }

    fn resolve(&self, height: BlockHeight) -> Result<Block<Transaction>, SourceError> {
        let mut chain = self.chain.lock().unwrap();
        let head = self.head(&chain);
        let number = match height {
            BlockHeight::Latest => head,
            BlockHeight::Number(number) => number,
        };
        if chain.broken == Some(number) {
            return Err(SourceError::Rpc(format!("block {number} unavailable")));
        }
        if number > head {
            return Err(SourceError::NotFound(height));
        }
        chain.fetched.push(number);
        if let (Some(delay), Some(clock)) = (chain.slow_blocks.remove(&number), &self.clock) {
            clock.skew(delay);
        }
        Ok(Block {
            number: Some(U64::from(number)),
            hash: Some(H256::from_low_u64_be(number)),
            timestamp: U256::from(number * chain.period),
            transactions: chain.transactions.get(&number).cloned().unwrap_or_default(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl BlockSource for FakeSource {
    async fn header(&self, height: BlockHeight) -> Result<BlockHeader, SourceError> {
        let chain = self.chain.lock().unwrap();
        let head = self.head(&chain);
        let number = match height {
            BlockHeight::Latest => head,
            BlockHeight::Number(number) => number,
        };
        if number > head {
            return Err(SourceError::NotFound(height));
        }
        Ok(BlockHeader {
            number,
            timestamp: number * chain.period,
        })
    }

    async fn block(&self, height: BlockHeight) -> Result<Block<Transaction>, SourceError> {
        self.resolve(height)
    }

    async fn transaction_sender(
        &self,
        block: &Block<Transaction>,
        index: usize,
    ) -> Result<Address, SourceError> {
        let tx = block
            .transactions
            .get(index)
            .ok_or_else(|| SourceError::Sender(format!("no transaction at {index}")))?;
        let chain = self.chain.lock().unwrap();
        chain.senders.get(&tx.hash).cloned().unwrap_or(Ok(tx.from))
    }

    async fn trace_transaction(
        &self,
        hash: H256,
        _config: &TraceConfig,
    ) -> Result<Vec<InternalTransfer>, SourceError> {
        self.trace_calls.fetch_add(1, Ordering::SeqCst);
        let chain = self.chain.lock().unwrap();
        chain.traces.get(&hash).cloned().unwrap_or(Ok(Vec::new()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QualityOfService,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn transfer(&self) -> TransferTx {
        TransferTx::from_json(&self.payload).expect("payload is a transfer record")
    }
}

#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<Published>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingBus {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.topic).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BusError::Client("broker unavailable".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursor {
    height: Mutex<Option<u64>>,
    saves: Mutex<Vec<u64>>,
    fail_saves: bool,
    corrupt: bool,
}

impl MemoryCursor {
    pub fn at(height: u64) -> Self {
        Self {
            height: Mutex::new(Some(height)),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Default::default()
        }
    }

    /// Loading reports unreadable contents, as a garbled cursor file would.
    pub fn corrupt() -> Self {
        Self {
            corrupt: true,
            ..Default::default()
        }
    }

    pub fn saves(&self) -> Vec<u64> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockCursor for MemoryCursor {
    async fn load(&self) -> CursorResult<Option<u64>> {
        if self.corrupt {
            return Err(CursorError::Corrupt("garbage".to_string()));
        }
        Ok(*self.height.lock().unwrap())
    }

    async fn save(&self, height: u64) -> CursorResult<()> {
        if self.fail_saves {
            return Err(CursorError::Io(std::io::Error::other("disk full")));
        }
        *self.height.lock().unwrap() = Some(height);
        self.saves.lock().unwrap().push(height);
        Ok(())
    }
}
