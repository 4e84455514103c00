use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chain_notify_domain::{
    config::ConfigError, services::telemetry::TelemetryError, storage::CursorError, MonitorConfig,
    PendingConfig, TransferConfig,
};
use chain_notify_storage::FileCursor;

use crate::{
    bus::{BusError, MqttBus, MqttDriver},
    dispatch::{Dispatcher, PipelineMode},
    pipeline::{MonitorPipeline, PendingPipeline, TransferPipeline},
    rpc::{EthRpcSource, SourceError},
    ticker::SystemClock,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("ledger error: {0}")]
    Source(#[from] SourceError),
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("derived block period {0}s is not positive")]
    InvalidBlockPeriod(i64),
    #[error("task failed: {0}")]
    Task(String),
}

type TaskOutcome = (&'static str, Result<(), PipelineError>);

/// Task group for one pipeline. The first task to finish, for any reason,
/// cancels the rest; [`Workers::join`] reports the first failure.
pub struct Workers {
    tasks: JoinSet<TaskOutcome>,
    cancel: CancellationToken,
}

impl Workers {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => debug!(task = name, "task finished"),
                Err(err) => error!(task = name, %err, "task failed"),
            }
            cancel.cancel();
            (name, result)
        });
    }

    /// Runs a broker connection until the group is cancelled.
    pub fn spawn_driver(&mut self, name: &'static str, driver: MqttDriver) {
        let cancel = self.cancel.clone();
        self.spawn(name, async move {
            driver.run(cancel).await;
            Ok(())
        });
    }

    pub async fn join(mut self) -> Result<(), PipelineError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(err))) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!(%err, "task aborted");
                    self.cancel.cancel();
                    first_error.get_or_insert(PipelineError::Task(err.to_string()));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

pub async fn run_pending(
    config: &PendingConfig,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let mut workers = Workers::new(cancel.clone());

    let (subscriber, subscribe_driver) = MqttBus::connect(config.subscribe())?;
    let (publisher, publish_driver) = MqttBus::connect(config.publish())?;
    let topic = config.subscribe().require_topic()?;
    let inbound = subscriber.subscribe(topic, config.subscribe().qos()).await?;
    info!(topic, "pending pipeline subscribed");

    workers.spawn_driver("pending-subscribe-bus", subscribe_driver);
    workers.spawn_driver("pending-publish-bus", publish_driver);

    let dispatcher =
        Dispatcher::from_config(Arc::new(publisher), config.publish(), PipelineMode::Pending);
    workers.spawn(
        "pending-listener",
        PendingPipeline::new(dispatcher).run(inbound, cancel),
    );

    workers.join().await
}

pub async fn run_transfer(
    config: &TransferConfig,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let mut workers = Workers::new(cancel);

    let source = Arc::new(EthRpcSource::connect(config.ledger().rpc_url())?);
    let (subscriber, subscribe_driver) = MqttBus::connect(config.subscribe())?;
    let (publisher, publish_driver) = MqttBus::connect(config.publish())?;
    let topic = config.subscribe().require_topic()?;
    let inbound = subscriber.subscribe(topic, config.subscribe().qos()).await?;
    info!(topic, delay = config.ledger().delay(), "transfer pipeline subscribed");

    workers.spawn_driver("transfer-subscribe-bus", subscribe_driver);
    workers.spawn_driver("transfer-publish-bus", publish_driver);

    let dispatcher =
        Dispatcher::from_config(Arc::new(publisher), config.publish(), PipelineMode::Transfer);
    let mut pipeline = TransferPipeline::new(
        source,
        dispatcher,
        config.ledger().delay(),
        Arc::new(SystemClock),
    );
    if let Some(path) = config.cursor_path() {
        pipeline = pipeline.with_cursor(Arc::new(FileCursor::new(path.clone())));
    }
    pipeline.spawn(&mut workers, inbound);

    workers.join().await
}

pub async fn run_monitor(
    config: &MonitorConfig,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let mut workers = Workers::new(cancel.clone());

    let source = Arc::new(EthRpcSource::connect(config.ledger().rpc_url())?);
    let (publisher, publish_driver) = MqttBus::connect(config.publish())?;
    workers.spawn_driver("monitor-publish-bus", publish_driver);

    let dispatcher =
        Dispatcher::from_config(Arc::new(publisher), config.publish(), PipelineMode::Monitor);
    let cursor = Arc::new(FileCursor::new(config.cursor_path().clone()));
    let pipeline = MonitorPipeline::new(
        source,
        dispatcher,
        cursor,
        config.ledger().delay(),
        config.trace().clone(),
    );
    workers.spawn("monitor-loop", pipeline.run(cancel));

    workers.join().await
}
