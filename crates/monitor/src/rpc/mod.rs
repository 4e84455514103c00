use async_trait::async_trait;
use chain_notify_domain::TraceConfig;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, Block, BlockId, Transaction, H256};
use metrics::counter;
use thiserror::Error;

mod types;

pub use types::{BlockHeader, BlockHeight, CallFrame, InternalTransfer, TraceRequest};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The height has not been produced yet.
    #[error("block {0} not found")]
    NotFound(BlockHeight),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("trace failed: {0}")]
    Trace(String),
    #[error("sender recovery failed: {0}")]
    Sender(String),
}

/// Read access to the ledger used by the ticker and the monitor loop.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn header(&self, height: BlockHeight) -> Result<BlockHeader, SourceError>;
    async fn block(&self, height: BlockHeight) -> Result<Block<Transaction>, SourceError>;
    /// Sender of the transaction at `index` within `block`.
    async fn transaction_sender(
        &self,
        block: &Block<Transaction>,
        index: usize,
    ) -> Result<Address, SourceError>;
    async fn trace_transaction(
        &self,
        hash: H256,
        config: &TraceConfig,
    ) -> Result<Vec<InternalTransfer>, SourceError>;
}

/// JSON-RPC backed ledger source.
#[derive(Debug, Clone)]
pub struct EthRpcSource {
    provider: Provider<Http>,
}

impl EthRpcSource {
    pub fn new(provider: Provider<Http>) -> Self {
        Self { provider }
    }

    pub fn connect(rpc_url: &str) -> Result<Self, SourceError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|err| SourceError::Rpc(format!("invalid rpc url `{rpc_url}`: {err}")))?;
        Ok(Self::new(provider))
    }
}

fn rpc_error(method: &'static str, err: ProviderError) -> SourceError {
    counter!("notify_rpc_calls_total", "method" => method, "result" => "error").increment(1);
    SourceError::Rpc(err.to_string())
}

fn block_id(height: BlockHeight) -> BlockId {
    BlockId::Number(height.into())
}

#[async_trait]
impl BlockSource for EthRpcSource {
    async fn header(&self, height: BlockHeight) -> Result<BlockHeader, SourceError> {
        let block = self
            .provider
            .get_block(block_id(height))
            .await
            .map_err(|err| rpc_error("eth_getBlockByNumber", err))?
            .ok_or(SourceError::NotFound(height))?;
        let number = block.number.ok_or(SourceError::NotFound(height))?;
        Ok(BlockHeader {
            number: number.as_u64(),
            timestamp: block.timestamp.low_u64(),
        })
    }

    async fn block(&self, height: BlockHeight) -> Result<Block<Transaction>, SourceError> {
        let block = self
            .provider
            .get_block_with_txs(block_id(height))
            .await
            .map_err(|err| rpc_error("eth_getBlockByNumber", err))?
            .ok_or(SourceError::NotFound(height))?;
        if block.number.is_none() {
            return Err(SourceError::NotFound(height));
        }
        Ok(block)
    }

    async fn transaction_sender(
        &self,
        block: &Block<Transaction>,
        index: usize,
    ) -> Result<Address, SourceError> {
        let tx = block
            .transactions
            .get(index)
            .ok_or_else(|| SourceError::Sender(format!("no transaction at index {index}")))?;
        match tx.recover_from() {
            Ok(sender) => Ok(sender),
            // Some nodes return transactions whose signature fields do not
            // recover locally; trust the node-reported sender then.
            Err(_) if !tx.from.is_zero() => Ok(tx.from),
            Err(err) => Err(SourceError::Sender(err.to_string())),
        }
    }

    async fn trace_transaction(
        &self,
        hash: H256,
        config: &TraceConfig,
    ) -> Result<Vec<InternalTransfer>, SourceError> {
        let request = TraceRequest::from(config);
        let frame: CallFrame = self
            .provider
            .request("debug_traceTransaction", (hash, request))
            .await
            .map_err(|err| SourceError::Trace(err.to_string()))?;
        Ok(frame.internal_transfers())
    }
}
