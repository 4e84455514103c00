use std::sync::Arc;
use std::time::Duration;

use chain_notify_domain::storage::BlockCursor;
use chain_notify_domain::TraceConfig;
use ethers::types::{Block, Transaction};
use metrics::{counter, gauge};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classifier::classify_block_transaction;
use crate::dispatch::Dispatcher;
use crate::rpc::{BlockHeight, BlockSource, SourceError};
use crate::ticker::{derive_block_period, load_cursor};
use crate::worker::PipelineError;

/// Polls the ledger once per block period and publishes every transaction of
/// each block that is at least `delay` blocks deep.
pub struct MonitorPipeline<S: ?Sized> {
    source: Arc<S>,
    dispatcher: Dispatcher,
    cursor: Arc<dyn BlockCursor>,
    delay: u64,
    trace: TraceConfig,
}

impl<S> MonitorPipeline<S>
where
    S: BlockSource + ?Sized,
{
    pub fn new(
        source: Arc<S>,
        dispatcher: Dispatcher,
        cursor: Arc<dyn BlockCursor>,
        delay: u64,
        trace: TraceConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            cursor,
            delay,
            trace,
        }
    }

    pub fn confirmation_depth(&self) -> u64 {
        self.delay + 1
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let (head, period) = derive_block_period(self.source.as_ref()).await?;
        let mut current = match load_cursor(self.cursor.as_ref()).await? {
            Some(saved) => saved,
            None => head.number.saturating_sub(self.delay),
        };
        if head.number < self.delay {
            info!(head = head.number, delay = self.delay, "waiting for chain to outgrow delay");
        }
        info!(start = current, head = head.number, tracer = self.trace.enabled(), "monitor started");

        let mut ticks = tokio::time::interval(Duration::from_secs(period as u64));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {}
            }
            self.catch_up(&mut current, &cancel).await?;
        }
    }

    /// Processes every height from `current` up to `head - delay`, saving the
    /// cursor before each block is handled. Returns the number of blocks
    /// handled.
    pub async fn catch_up(
        &self,
        current: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let latest = match self.source.block(BlockHeight::Latest).await {
            Ok(block) => block,
            Err(SourceError::NotFound(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let head = latest.number.map(|n| n.as_u64()).unwrap_or_default();
        debug!(head, current = *current, "polled head");

        let mut handled = 0;
        while *current + self.delay <= head && !cancel.is_cancelled() {
            let block = if *current == head {
                latest.clone()
            } else {
                match self.source.block(BlockHeight::Number(*current)).await {
                    Ok(block) => block,
                    Err(SourceError::NotFound(_)) => break,
                    Err(err) => return Err(err.into()),
                }
            };

            self.cursor.save(*current).await?;
            *current += 1;
            self.handle_block(&block).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_block(&self, block: &Block<Transaction>) {
        let number = block.number.map(|n| n.as_u64()).unwrap_or_default();
        info!(block = number, txs = block.transactions.len(), "handling block");

        for index in 0..block.transactions.len() {
            let records =
                classify_block_transaction(self.source.as_ref(), block, index, &self.trace).await;
            for record in &records {
                self.dispatcher
                    .publish_confirmed(record, self.confirmation_depth())
                    .await;
            }
        }

        counter!("notify_blocks_emitted_total").increment(1);
        gauge!("notify_last_height").set(number as f64);
    }
}
