//! Domain-level building blocks shared by the notification pipelines.
//!
//! Everything here is free of network I/O: the transfer record and its wire
//! shape, topic naming, configuration loading, the cursor capability and
//! process telemetry wiring.

pub mod config;
pub mod model;
pub mod services;
pub mod summary;
pub mod topic;

pub mod storage {
    mod traits;

    pub use traits::*;
}

pub use config::{
    BrokerConfig, BrokerEndpoint, BrokerRole, ConfigError, LedgerConfig, LedgerOverrides,
    MonitorConfig, PendingConfig, TraceConfig, TransferConfig, DEFAULT_CURSOR_PATH,
};
pub use model::{QualityOfService, TransferTx};
pub use storage::{BlockCursor, CursorError, CursorResult};
pub use summary::ConfigSummary;
