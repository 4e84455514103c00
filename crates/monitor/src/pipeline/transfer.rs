use std::sync::Arc;

use chain_notify_domain::storage::BlockCursor;
use chain_notify_domain::TransferTx;
use ethers::types::{Block, Transaction};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::queue::{ConfirmationQueue, ConfirmationTracker, PendingEntry};
use crate::rpc::BlockSource;
use crate::ticker::{BlockTicker, Clock};
use crate::worker::{PipelineError, Workers};

/// Blocks buffered between the ticker and the confirmation consumer.
pub const BLOCK_CAPACITY: usize = 10;

/// Confirms previously announced pending transactions once they are mined
/// and buried under the configured delay.
pub struct TransferPipeline<S: ?Sized> {
    source: Arc<S>,
    dispatcher: Dispatcher,
    delay: u64,
    clock: Arc<dyn Clock>,
    cursor: Option<Arc<dyn BlockCursor>>,
}

impl<S> TransferPipeline<S>
where
    S: BlockSource + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, dispatcher: Dispatcher, delay: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            dispatcher,
            delay,
            clock,
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Arc<dyn BlockCursor>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Starts the listener, the ticker and the consumer on `workers`.
    pub fn spawn(self, workers: &mut Workers, inbound: mpsc::Receiver<Vec<u8>>) {
        let cancel = workers.cancel_token();
        let queue = Arc::new(ConfirmationQueue::new());
        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_CAPACITY);

        let mut ticker = BlockTicker::new(self.source, self.delay, self.clock);
        if let Some(cursor) = self.cursor {
            ticker = ticker.with_cursor(cursor);
        }
        let tracker = ConfirmationTracker::new(self.delay, self.dispatcher);

        workers.spawn(
            "transfer-listener",
            listen_pending(queue.clone(), inbound, cancel.clone()),
        );
        workers.spawn("block-ticker", ticker.run(blocks_tx, cancel.clone()));
        workers.spawn(
            "confirmation-consumer",
            consume_blocks(tracker, queue, blocks_rx, cancel),
        );
    }
}

/// Queues every pending record received from the bus.
pub async fn listen_pending(
    queue: Arc<ConfirmationQueue>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            payload = inbound.recv() => payload,
        };
        let Some(payload) = payload else {
            debug!("pending feed closed");
            return Ok(());
        };

        match TransferTx::from_json(&payload) {
            Ok(event) => {
                debug!(hash = ?event.hash, "queued pending transfer");
                queue.push(PendingEntry::new(event));
            }
            Err(err) => {
                warn!(%err, "dropping undecodable pending record");
                counter!("notify_transactions_skipped_total", "reason" => "bad_record")
                    .increment(1);
            }
        }
    }
}

/// Runs one confirmation pass per delivered block.
pub async fn consume_blocks(
    mut tracker: ConfirmationTracker,
    queue: Arc<ConfirmationQueue>,
    mut blocks: mpsc::Receiver<Block<Transaction>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    info!(age_limit = tracker.age_limit(), "confirmation consumer started");
    loop {
        let block = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            block = blocks.recv() => block,
        };
        let Some(block) = block else {
            debug!("block feed closed");
            return Ok(());
        };
        tracker.on_block(&queue, &block).await;
    }
}
