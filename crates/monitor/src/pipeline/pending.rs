use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::decode_raw_transaction;
use crate::dispatch::Dispatcher;
use crate::worker::PipelineError;

/// Confirmation depth advertised for transactions that are not mined yet.
pub const PENDING_DEPTH: u64 = 1;

/// Decodes raw signed transactions as they arrive and announces them.
pub struct PendingPipeline {
    dispatcher: Dispatcher,
}

impl PendingPipeline {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Publishes one raw transaction to the fixed topic and then to its
    /// recipient topic. Returns `false` when the payload was dropped.
    pub async fn handle_message(&self, payload: &[u8]) -> bool {
        let tx = match decode_raw_transaction(payload) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "dropping raw transaction");
                counter!("notify_transactions_skipped_total", "reason" => err.reason())
                    .increment(1);
                return false;
            }
        };

        self.dispatcher.publish_fixed(&tx).await;
        self.dispatcher.publish_confirmed(&tx, PENDING_DEPTH).await;
        true
    }

    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                payload = inbound.recv() => payload,
            };
            let Some(payload) = payload else {
                debug!("raw transaction feed closed");
                return Ok(());
            };
            self.handle_message(&payload).await;
        }
    }
}
