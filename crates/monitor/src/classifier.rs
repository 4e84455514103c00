//! Turns raw ledger transactions into transfer records.

use chain_notify_domain::{TraceConfig, TransferTx};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Block, Transaction, H256};
use ethers::utils::{keccak256, rlp::Rlp};
use metrics::counter;
use thiserror::Error;
use tracing::warn;

use crate::rpc::BlockSource;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("payload is not utf-8 text")]
    NotText,
    #[error("payload is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("payload is empty")]
    Empty,
    #[error("malformed signed transaction: {0}")]
    Decode(String),
    #[error("signature recovery failed: {0}")]
    Recover(String),
    #[error("recovered sender is the zero address")]
    NullSender,
}

impl ClassifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotText | Self::Hex(_) | Self::Empty => "bad_encoding",
            Self::Decode(_) => "bad_transaction",
            Self::Recover(_) | Self::NullSender => "bad_signature",
        }
    }
}

/// Decodes a hex-encoded signed transaction (legacy or typed envelope) and
/// recovers its sender from the signature.
pub fn decode_raw_transaction(payload: &[u8]) -> Result<TransferTx, ClassifyError> {
    let text = std::str::from_utf8(payload).map_err(|_| ClassifyError::NotText)?;
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let raw = hex::decode(digits)?;
    if raw.is_empty() {
        return Err(ClassifyError::Empty);
    }

    let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw))
        .map_err(|err| ClassifyError::Decode(err.to_string()))?;
    let from = signature
        .recover(tx.sighash())
        .map_err(|err| ClassifyError::Recover(err.to_string()))?;
    if from.is_zero() {
        return Err(ClassifyError::NullSender);
    }

    Ok(TransferTx {
        from,
        to: tx.to().and_then(|to| to.as_address().copied()),
        value: tx.value().copied().unwrap_or_default(),
        hash: H256::from(keccak256(&raw)),
        data: tx.data().cloned().unwrap_or_default(),
        block_number: None,
    })
}

/// Classifies the transaction at `index` of a confirmed block.
///
/// With tracing enabled every value-moving frame becomes a record sharing the
/// transaction hash. An empty or failed trace, or tracing being off, falls
/// back to a single record for the top-level call. Returns nothing when the
/// sender cannot be determined.
pub async fn classify_block_transaction<S>(
    source: &S,
    block: &Block<Transaction>,
    index: usize,
    trace: &TraceConfig,
) -> Vec<TransferTx>
where
    S: BlockSource + ?Sized,
{
    let Some(tx) = block.transactions.get(index) else {
        return Vec::new();
    };
    let block_number = block.number.map(|n| n.as_u64()).unwrap_or_default();

    if trace.enabled() {
        match source.trace_transaction(tx.hash, trace).await {
            Ok(transfers) if !transfers.is_empty() => {
                return transfers
                    .into_iter()
                    .map(|transfer| TransferTx {
                        from: transfer.from,
                        to: transfer.to,
                        value: transfer.value,
                        hash: tx.hash,
                        data: transfer.input,
                        block_number: None,
                    }
                    .confirmed_at(block_number))
                    .collect();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(hash = ?tx.hash, %err, "trace failed, using top-level transfer");
                counter!("notify_trace_fallback_total").increment(1);
            }
        }
    }

    let from = match source.transaction_sender(block, index).await {
        Ok(from) if !from.is_zero() => from,
        Ok(_) => {
            warn!(hash = ?tx.hash, "skipping transaction with zero sender");
            counter!("notify_transactions_skipped_total", "reason" => "null_sender").increment(1);
            return Vec::new();
        }
        Err(err) => {
            warn!(hash = ?tx.hash, %err, "skipping transaction without sender");
            counter!("notify_transactions_skipped_total", "reason" => "sender").increment(1);
            return Vec::new();
        }
    };

    vec![TransferTx {
        from,
        to: tx.to,
        value: tx.value,
        hash: tx.hash,
        data: tx.input.clone(),
        block_number: None,
    }
    .confirmed_at(block_number)]
}
