//! Message bus seam plus its MQTT implementation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chain_notify_domain::{BrokerConfig, ConfigError, QualityOfService};
use metrics::counter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of inbound message buffers handed to subscribers.
pub const INBOUND_CAPACITY: usize = 10;
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker config error: {0}")]
    Config(#[from] ConfigError),
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("subscription lock poisoned")]
    Poisoned,
}

impl From<rumqttc::ClientError> for BusError {
    fn from(value: rumqttc::ClientError) -> Self {
        Self::Client(value.to_string())
    }
}

/// Outbound side of the broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        (**self).publish(topic, qos, payload).await
    }
}

fn to_mqtt_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[derive(Clone)]
struct Subscription {
    topic: String,
    qos: QoS,
    sender: mpsc::Sender<Vec<u8>>,
}

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

/// One broker session. The paired [`MqttDriver`] polls the connection and
/// restores subscriptions after every connection ack.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

impl MqttBus {
    /// Builds the session. Nothing touches the network until the returned
    /// driver is run.
    pub fn connect(config: &BrokerConfig) -> Result<(Self, MqttDriver), BusError> {
        let endpoint = config.endpoint()?;
        let mut options = MqttOptions::new(config.client_id(), endpoint.host, endpoint.port);
        options.set_credentials(config.username(), config.password());
        options.set_keep_alive(KEEP_ALIVE);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));
        let driver = MqttDriver {
            event_loop,
            client: client.clone(),
            subscriptions: subscriptions.clone(),
            client_id: config.client_id().to_string(),
        };

        Ok((
            Self {
                client,
                subscriptions,
            },
            driver,
        ))
    }

    /// Registers interest in `topic` and returns the bounded receiver its
    /// messages are delivered on.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QualityOfService,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BusError> {
        let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY);
        let qos = to_mqtt_qos(qos);
        self.subscriptions
            .lock()
            .map_err(|_| BusError::Poisoned)?
            .push(Subscription {
                topic: topic.to_string(),
                qos,
                sender,
            });
        self.client.subscribe(topic, qos).await?;
        Ok(receiver)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await?;
        Ok(())
    }
}

/// Owns the rumqttc event loop. Reconnects happen implicitly on the next
/// poll after an error.
pub struct MqttDriver {
    event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    client_id: String,
}

impl MqttDriver {
    /// Polls until `cancel` fires, then sends a best-effort disconnect.
    pub async fn run(mut self, cancel: CancellationToken) {
        let client_id = self.client_id.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(%client_id, "broker connected");
                    for sub in snapshot(&self.subscriptions) {
                        if let Err(err) = self.client.try_subscribe(sub.topic.clone(), sub.qos) {
                            warn!(%client_id, topic = %sub.topic, ?err, "resubscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    route_publish(&self.subscriptions, &publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%client_id, ?err, "broker connection error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
            }
        }
        self.shutdown().await;
        debug!(%client_id, "mqtt event loop stopped");
    }

    async fn shutdown(mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(client_id = %self.client_id, "disconnect not flushed before timeout");
        }
    }
}

/// Hands an inbound message to every subscriber of `topic` without waiting.
/// A full buffer drops the message for that subscriber so the event loop
/// keeps answering keep-alives. Returns how many subscribers took it.
fn route_publish(subscriptions: &Subscriptions, topic: &str, payload: &[u8]) -> usize {
    let mut delivered = 0;
    for sub in snapshot(subscriptions) {
        if sub.topic != topic {
            continue;
        }
        match sub.sender.try_send(payload.to_vec()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(%topic, capacity = INBOUND_CAPACITY, "subscriber lagging, dropping message");
                counter!("notify_inbound_dropped_total").increment(1);
            }
            Err(TrySendError::Closed(_)) => debug!(%topic, "subscriber dropped"),
        }
    }
    delivered
}

fn snapshot(subscriptions: &Subscriptions) -> Vec<Subscription> {
    match subscriptions.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
