use std::sync::Arc;

use chain_notify_domain::{topic::topic_for, BrokerConfig, QualityOfService, TransferTx};
use metrics::counter;
use strum_macros::IntoStaticStr;
use tracing::{info, warn};

use crate::bus::MessageBus;

/// Pipeline label attached to publish metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineMode {
    Monitor,
    Pending,
    Transfer,
}

/// Serializes records and hands them to the bus.
///
/// Publishing is fire-and-forget: failures are logged and counted but never
/// returned, delivery retry belongs to the bus client.
#[derive(Clone)]
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    qos: QualityOfService,
    prefix: String,
    fixed_topic: Option<String>,
    mode: PipelineMode,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        qos: QualityOfService,
        prefix: impl Into<String>,
        fixed_topic: Option<String>,
        mode: PipelineMode,
    ) -> Self {
        Self {
            bus,
            qos,
            prefix: prefix.into(),
            fixed_topic,
            mode,
        }
    }

    pub fn from_config(bus: Arc<dyn MessageBus>, config: &BrokerConfig, mode: PipelineMode) -> Self {
        Self::new(
            bus,
            config.qos(),
            config.prefix_topic(),
            config.topic().map(str::to_owned),
            mode,
        )
    }

    /// Publishes to the configured fixed topic, if any.
    pub async fn publish_fixed(&self, tx: &TransferTx) {
        if let Some(topic) = &self.fixed_topic {
            self.publish_to(topic, tx).await;
        }
    }

    /// Publishes to the recipient-keyed topic for `depth`, or to the contract
    /// creation topic when the record has no recipient.
    pub async fn publish_confirmed(&self, tx: &TransferTx, depth: u64) {
        let topic = topic_for(&self.prefix, tx, depth);
        self.publish_to(&topic, tx).await;
    }

    async fn publish_to(&self, topic: &str, tx: &TransferTx) {
        let pipeline: &'static str = self.mode.into();
        let payload = match tx.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, hash = ?tx.hash, "failed to encode transfer");
                counter!("notify_events_published_total", "pipeline" => pipeline, "result" => "encode_error")
                    .increment(1);
                return;
            }
        };

        match self.bus.publish(topic, self.qos, payload).await {
            Ok(()) => {
                info!(pipeline, topic, hash = ?tx.hash, "published transfer");
                counter!("notify_events_published_total", "pipeline" => pipeline, "result" => "ok")
                    .increment(1);
            }
            Err(err) => {
                warn!(pipeline, topic, hash = ?tx.hash, %err, "publish failed");
                counter!("notify_events_published_total", "pipeline" => pipeline, "result" => "error")
                    .increment(1);
            }
        }
    }
}
