//! The three ways of turning ledger activity into bus notifications.

mod monitor;
mod pending;
mod transfer;

pub use monitor::MonitorPipeline;
pub use pending::{PendingPipeline, PENDING_DEPTH};
pub use transfer::{consume_blocks, listen_pending, TransferPipeline, BLOCK_CAPACITY};
