//! Bus delivery path and subscriber
//!
//! When a recipient is not connected to this node the router publishes the
//! signed envelope to a shared topic. Every node runs one subscriber on that
//! topic; it skips its own publications and hands everything else back to
//! the router, which can only deliver locally or drop.
//!
//! Two implementations share the [`Bus`] contract:
//! - [`MqttBus`]: QoS 1 on an MQTT broker, manual acks, clean session
//!   (a restarted node only sees new publications)
//! - [`MemoryBus`]: in-process broadcast channel for single-process
//!   deployments and tests

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::envelope::BusEnvelope;
use crate::error::BusError;
use crate::metrics;
use crate::router::{Origin, RouteOutcome, Router};

/// Publish side of the bus
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError>;
}

/// What the subscriber did with one bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberOutcome {
    /// Published by this node; discarded before verification
    SkippedOwn,
    Malformed,
    Routed(RouteOutcome),
}

impl SubscriberOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberOutcome::SkippedOwn => "own",
            SubscriberOutcome::Malformed => "malformed",
            SubscriberOutcome::Routed(outcome) => outcome.as_str(),
        }
    }
}

/// Per-message callback of the bus consumer
#[derive(Clone)]
pub struct BusSubscriber {
    router: Arc<Router>,
}

impl BusSubscriber {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Process one payload. The caller has already acknowledged it, so any
    /// failure here is final.
    pub async fn handle_payload(&self, payload: &[u8]) -> SubscriberOutcome {
        let outcome = match BusEnvelope::from_slice(payload) {
            Err(e) => {
                tracing::warn!(error = %e, size = payload.len(), "Dropping undecodable bus message");
                SubscriberOutcome::Malformed
            }
            Ok(bus_envelope) if bus_envelope.cap_id == self.router.cap_id() => {
                tracing::trace!(cap_id = %bus_envelope.cap_id, "Skipping own bus publication");
                SubscriberOutcome::SkippedOwn
            }
            Ok(bus_envelope) => {
                tracing::debug!(
                    from_cap = %bus_envelope.cap_id,
                    to = %bus_envelope.envelope.to_id,
                    "Received bus message"
                );
                SubscriberOutcome::Routed(self.router.route(bus_envelope.envelope, Origin::Bus).await)
            }
        };

        metrics::BUS_RECEIVED.with_label_values(&[outcome.as_str()]).inc();
        outcome
    }
}

/// Configuration for the MQTT bus
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("cap-{}", uuid::Uuid::new_v4()),
            topic: "cap/messages".to_string(),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 1024 * 1024,
        }
    }
}

/// MQTT publisher handle; cheap to share behind an `Arc`
pub struct MqttBus {
    client: AsyncClient,
    topic: String,
}

/// The consuming half of the MQTT bus: owns the event loop
pub struct MqttSubscription {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl MqttBus {
    /// Create the client. Nothing touches the network until the
    /// subscription's event loop is polled.
    pub fn new(config: MqttBusConfig) -> (Self, MqttSubscription) {
        let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_manual_acks(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

        let (client, eventloop) = AsyncClient::new(options, 64);

        let bus = Self {
            client: client.clone(),
            topic: config.topic.clone(),
        };
        let subscription = MqttSubscription {
            client,
            eventloop,
            topic: config.topic,
        };

        (bus, subscription)
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        let payload = envelope.to_vec()?;

        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }
}

impl MqttSubscription {
    /// Drive the MQTT connection and feed publications to `subscriber`, one
    /// at a time, until `shutdown` fires.
    pub async fn run(mut self, subscriber: BusSubscriber, shutdown: CancellationToken) {
        tracing::info!(topic = %self.topic, "Bus subscriber started");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Connected to MQTT broker");
                    // Subscribe after every (re)connect; clean sessions forget subscriptions
                    if let Err(e) = self.client.try_subscribe(self.topic.clone(), QoS::AtLeastOnce) {
                        tracing::error!(topic = %self.topic, error = %e, "Failed to subscribe to bus topic");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    tracing::info!(topic = %self.topic, ?suback, "Subscribed to bus topic");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Ack before processing: a message that fails afterwards is not redelivered
                    if let Err(e) = self.client.try_ack(&publish) {
                        tracing::warn!(error = %e, "Failed to acknowledge bus message");
                    }
                    subscriber.handle_payload(&publish.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::info!("Disconnected from MQTT broker");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "MQTT connection error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }
        tracing::info!("Bus subscriber stopped");
    }
}

/// In-process bus over a broadcast channel. Clones share the same topic.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Vec<u8>>,
}

/// A subscriber attached to a [`MemoryBus`]
pub struct MemorySubscription {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new consumer; it only sees messages published from now on
    pub fn subscribe(&self) -> MemorySubscription {
        MemorySubscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        let payload = envelope.to_vec()?;
        self.tx
            .send(payload)
            .map(|_| ())
            .map_err(|_| BusError::Unavailable("no subscribers attached to memory bus".to_string()))
    }
}

impl MemorySubscription {
    pub async fn run(mut self, subscriber: BusSubscriber, shutdown: CancellationToken) {
        tracing::info!("Memory bus subscriber started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => received,
            };

            match received {
                Ok(payload) => {
                    subscriber.handle_payload(&payload).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Memory bus subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        tracing::info!("Memory bus subscriber stopped");
    }
}
