//! Drift-corrected block scheduler.
//!
//! The ticker walks heights `head - N`, `head - N + 1`, ... and sleeps until
//! block `h + N + 1` should exist before asking for the next one. When it
//! wakes up more than [`RESYNC_TOLERANCE_MS`] late it jumps straight to the
//! current `head - N` instead of replaying the backlog.

use std::sync::Arc;
use std::time::Duration;

use chain_notify_domain::storage::{BlockCursor, CursorError};
use ethers::types::{Block, Transaction};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{BlockHeader, BlockHeight, BlockSource, SourceError};
use crate::worker::PipelineError;

/// Lateness beyond which the ticker resynchronizes with the head.
pub const RESYNC_TOLERANCE_MS: i64 = -100;

/// Wall clock in milliseconds since the unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Samples the head and its parent to find the chain's block period in
/// seconds. Returns the head header alongside the period.
pub async fn derive_block_period<S>(source: &S) -> Result<(BlockHeader, i64), PipelineError>
where
    S: BlockSource + ?Sized,
{
    let head = source.header(BlockHeight::Latest).await?;
    let Some(parent_number) = head.number.checked_sub(1) else {
        return Err(PipelineError::InvalidBlockPeriod(0));
    };
    let parent = source.header(BlockHeight::Number(parent_number)).await?;
    let period = head.timestamp as i64 - parent.timestamp as i64;
    if period <= 0 {
        return Err(PipelineError::InvalidBlockPeriod(period));
    }
    info!(period_secs = period, head = head.number, "derived block period");
    Ok((head, period))
}

/// Reads the saved height. Unreadable contents are logged and treated as no
/// cursor, so the caller starts from `head - N`. I/O failures stay fatal.
pub async fn load_cursor(cursor: &dyn BlockCursor) -> Result<Option<u64>, PipelineError> {
    match cursor.load().await {
        Ok(saved) => Ok(saved),
        Err(CursorError::Corrupt(contents)) => {
            warn!(%contents, "ignoring unreadable block cursor");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Milliseconds until block `block_ts` has `delay + 1` successors.
pub fn next_sleep_millis(period_secs: i64, delay: u64, block_ts: u64, now_ms: i64) -> i64 {
    (period_secs * (delay as i64 + 1) + block_ts as i64) * 1000 - now_ms
}

pub type BlockSender = mpsc::Sender<Block<Transaction>>;

pub struct BlockTicker<S: ?Sized> {
    source: Arc<S>,
    delay: u64,
    clock: Arc<dyn Clock>,
    cursor: Option<Arc<dyn BlockCursor>>,
}

impl<S> BlockTicker<S>
where
    S: BlockSource + ?Sized,
{
    pub fn new(source: Arc<S>, delay: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            delay,
            clock,
            cursor: None,
        }
    }

    /// Persists each emitted height before it is sent downstream and resumes
    /// from the saved height when it is ahead of `head - N`.
    pub fn with_cursor(mut self, cursor: Arc<dyn BlockCursor>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Emits blocks on `output` until cancelled or the receiver goes away.
    /// Non-transient ledger errors end the loop with an error.
    pub async fn run(
        self,
        output: BlockSender,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let (head, period) = derive_block_period(self.source.as_ref()).await?;
        let mut height = head.number.saturating_sub(self.delay);
        if let Some(cursor) = &self.cursor {
            if let Some(saved) = load_cursor(cursor.as_ref()).await? {
                height = height.max(saved);
            }
        }
        info!(start = height, head = head.number, delay = self.delay, "block ticker started");

        loop {
            let Some(block) = self.fetch(height, period, &cancel).await? else {
                return Ok(());
            };
            let block_ts = block.timestamp.low_u64();
            if !self.emit(height, block, &output, &cancel).await? {
                return Ok(());
            }

            let mut sleep_ms =
                next_sleep_millis(period, self.delay, block_ts, self.clock.now_millis());
            if sleep_ms < RESYNC_TOLERANCE_MS {
                let head = self.source.header(BlockHeight::Latest).await?;
                let target = head.number.saturating_sub(self.delay);
                debug!(height, target, late_ms = -sleep_ms, "ticker fell behind");
                if target > height {
                    counter!("notify_ticker_resync_total").increment(1);
                    let Some(block) = self.fetch(target, period, &cancel).await? else {
                        return Ok(());
                    };
                    let block_ts = block.timestamp.low_u64();
                    if !self.emit(target, block, &output, &cancel).await? {
                        return Ok(());
                    }
                    height = target;
                    sleep_ms =
                        next_sleep_millis(period, self.delay, block_ts, self.clock.now_millis());
                }
            }

            height += 1;
            if sleep_ms > 0 {
                debug!(next = height, sleep_ms, "ticker sleeping");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms as u64)) => {}
                }
            }
        }
    }

    /// Fetches `height`, waiting one block period after every "not found".
    /// Returns `None` once cancelled.
    async fn fetch(
        &self,
        height: u64,
        period: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<Block<Transaction>>, PipelineError> {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = self.source.block(BlockHeight::Number(height)) => result,
            };
            match result {
                Ok(block) => return Ok(Some(block)),
                Err(SourceError::NotFound(_)) => {
                    debug!(height, "block not produced yet");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(Duration::from_secs(period as u64)) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Saves the cursor, then hands the block downstream. `false` means the
    /// consumer is gone or the ticker was cancelled.
    async fn emit(
        &self,
        height: u64,
        block: Block<Transaction>,
        output: &BlockSender,
        cancel: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        if let Some(cursor) = &self.cursor {
            cursor.save(height).await?;
        }
        let sent = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            sent = output.send(block) => sent,
        };
        if sent.is_err() {
            debug!(height, "block consumer closed");
            return Ok(false);
        }
        counter!("notify_blocks_emitted_total").increment(1);
        gauge!("notify_last_height").set(height as f64);
        Ok(true)
    }
}
