//! Pending transfers waiting to show up in a confirmed block.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chain_notify_domain::TransferTx;
use ethers::types::{Block, Transaction, H256};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

/// Extra block arrivals tolerated beyond the confirmation delay before an
/// unmatched entry is dropped, and extra blocks kept in the window.
pub const GRACE_BLOCKS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub event: TransferTx,
    /// Block arrivals this entry has survived without a match.
    pub age: u64,
}

impl PendingEntry {
    pub fn new(event: TransferTx) -> Self {
        Self { event, age: 0 }
    }
}

/// FIFO shared between the bus listener (push) and the block consumer
/// (pop). The lock is never held across an await.
#[derive(Debug, Default)]
pub struct ConfirmationQueue {
    entries: Mutex<VecDeque<PendingEntry>>,
}

impl ConfirmationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: PendingEntry) {
        let depth = {
            let mut entries = self.lock();
            entries.push_back(entry);
            entries.len()
        };
        gauge!("notify_queue_depth").set(depth as f64);
    }

    pub fn pop(&self) -> Option<PendingEntry> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingEntry>> {
        // Every critical section is a single deque call, so poisoning is ignored.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct WindowBlock {
    number: u64,
    hashes: HashSet<H256>,
}

/// Bounded history of recently delivered blocks, oldest first.
#[derive(Debug)]
pub struct BlockWindow {
    capacity: usize,
    blocks: VecDeque<WindowBlock>,
}

impl BlockWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, block: &Block<Transaction>) {
        let number = block.number.map(|n| n.as_u64()).unwrap_or_default();
        self.blocks.push_back(WindowBlock {
            number,
            hashes: block.transactions.iter().map(|tx| tx.hash).collect(),
        });
        while self.blocks.len() > self.capacity {
            self.blocks.pop_front();
        }
    }

    /// Number of the earliest retained block containing `hash`.
    pub fn find(&self, hash: &H256) -> Option<u64> {
        self.blocks
            .iter()
            .find(|block| block.hashes.contains(hash))
            .map(|block| block.number)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub confirmed: usize,
    pub requeued: usize,
    pub evicted: usize,
}

/// Matches queued transfers against arriving blocks.
pub struct ConfirmationTracker {
    window: BlockWindow,
    delay: u64,
    dispatcher: Dispatcher,
}

impl ConfirmationTracker {
    pub fn new(delay: u64, dispatcher: Dispatcher) -> Self {
        Self {
            window: BlockWindow::new((delay + GRACE_BLOCKS) as usize),
            delay,
            dispatcher,
        }
    }

    pub fn age_limit(&self) -> u64 {
        self.delay + GRACE_BLOCKS
    }

    /// Runs one pass over the entries queued before `block` arrived.
    pub async fn on_block(
        &mut self,
        queue: &ConfirmationQueue,
        block: &Block<Transaction>,
    ) -> CycleReport {
        self.window.push(block);
        let mut report = CycleReport::default();
        let snapshot = queue.len();

        for _ in 0..snapshot {
            let Some(mut entry) = queue.pop() else {
                break;
            };

            if let Some(number) = self.window.find(&entry.event.hash) {
                let confirmed = entry.event.confirmed_at(number);
                self.dispatcher
                    .publish_confirmed(&confirmed, self.delay + 1)
                    .await;
                counter!("notify_queue_confirmed_total").increment(1);
                report.confirmed += 1;
                continue;
            }

            entry.age += 1;
            if entry.age >= self.age_limit() {
                warn!(hash = ?entry.event.hash, age = entry.age, "discarding unconfirmed transaction");
                counter!("notify_queue_evicted_total").increment(1);
                report.evicted += 1;
            } else {
                queue.push(entry);
                report.requeued += 1;
            }
        }

        gauge!("notify_queue_depth").set(queue.len() as f64);
        if report.confirmed > 0 || report.evicted > 0 {
            info!(
                block = ?block.number,
                confirmed = report.confirmed,
                evicted = report.evicted,
                waiting = queue.len(),
                "confirmation pass"
            );
        } else {
            debug!(block = ?block.number, waiting = queue.len(), "confirmation pass");
        }
        report
    }
}
