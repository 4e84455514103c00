//! Ledger watcher that publishes transfer notifications to an MQTT broker.
//!
//! Three pipelines share the same seams: [`rpc::BlockSource`] for ledger
//! reads, [`bus::MessageBus`] for publishing and the domain `BlockCursor` for
//! resumable progress. The `chain-notify` binary wires the production
//! adapters; tests swap in the doubles from `test_support`.

pub mod bus;
pub mod classifier;
pub mod dispatch;
pub mod pipeline;
pub mod queue;
pub mod rpc;
pub mod ticker;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bus::{BusError, MessageBus, MqttBus, MqttDriver};
pub use dispatch::{Dispatcher, PipelineMode};
pub use rpc::{BlockSource, EthRpcSource, SourceError};
pub use worker::{run_monitor, run_pending, run_transfer, PipelineError, Workers};
