//! Message Router
//!
//! Decides, for every inbound envelope, between the local socket, the bus
//! and dropping it:
//!
//! ```text
//! decode ──▶ verify ──▶ signer == fromID ? ──▶ registry lookup(toID)
//!   │          │              │                   │
//!   ✗ drop     ✗ drop         ✗ drop              ├─ found ─────────────▶ deliver locally
//!                                                 ├─ miss, from client ─▶ publish to bus
//!                                                 └─ miss, from bus ────▶ drop
//! ```
//!
//! Every path ends in "delivered", "published" or "dropped and logged";
//! there is no pending or retry state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::Bus;
use crate::crypto::Verifier;
use crate::delivery::{deliver_local, DEFAULT_WRITE_TIMEOUT};
use crate::envelope::{BusEnvelope, Envelope};
use crate::error::DeliveryError;
use crate::identity::CapId;
use crate::metrics;
use crate::registry::ConnectionRegistry;

/// Where an envelope entered this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Directly from a client connected to this node
    Local,
    /// Re-delivered by the bus subscriber
    Bus,
}

/// Why an envelope was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    InvalidSignature,
    SignatureMismatch,
    DeliveryFailed,
    PublishFailed,
    RecipientAbsent,
    BusDisabled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::InvalidSignature => "invalid_signature",
            DropReason::SignatureMismatch => "signature_mismatch",
            DropReason::DeliveryFailed => "delivery_failed",
            DropReason::PublishFailed => "publish_failed",
            DropReason::RecipientAbsent => "recipient_absent",
            DropReason::BusDisabled => "bus_disabled",
        }
    }
}

/// Terminal state of a routed envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Published,
    Dropped(DropReason),
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Delivered => "delivered",
            RouteOutcome::Published => "published",
            RouteOutcome::Dropped(reason) => reason.as_str(),
        }
    }
}

/// Notified after a successful local delivery; persistence hooks in here
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    async fn on_delivered(&self, envelope: &Envelope);
}

pub struct Router {
    registry: ConnectionRegistry,
    verifier: Arc<dyn Verifier>,
    cap_id: CapId,
    bus: Option<Arc<dyn Bus>>,
    observer: Option<Arc<dyn DeliveryObserver>>,
    delivery_timeout: Duration,
}

impl Router {
    pub fn new(registry: ConnectionRegistry, verifier: Arc<dyn Verifier>, cap_id: CapId) -> Self {
        Self {
            registry,
            verifier,
            cap_id,
            bus: None,
            observer: None,
            delivery_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Deadline for a single local socket write
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn cap_id(&self) -> CapId {
        self.cap_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Decode a raw text frame and route it. Malformed input is dropped;
    /// the connection it came from is left alone.
    pub async fn route_frame(&self, raw: &str, origin: Origin) -> RouteOutcome {
        match Envelope::from_json(raw) {
            Ok(envelope) => self.route(envelope, origin).await,
            Err(e) => {
                tracing::warn!(?origin, error = %e, "Dropping undecodable envelope");
                let outcome = RouteOutcome::Dropped(DropReason::Malformed);
                metrics::MESSAGES_ROUTED.with_label_values(&[outcome.as_str()]).inc();
                outcome
            }
        }
    }

    /// Route a decoded envelope.
    ///
    /// The registry lookup and the bus publish are not atomic. A recipient
    /// that registers on this node after the lookup misses will not see the
    /// message: the bus copy comes back tagged with our own cap id and is
    /// discarded by our subscriber.
    pub async fn route(&self, envelope: Envelope, origin: Origin) -> RouteOutcome {
        let timer = metrics::Timer::new();
        let outcome = self.route_verified(envelope, origin).await;
        timer.observe_duration_seconds(&metrics::ROUTE_LATENCY);
        metrics::MESSAGES_ROUTED.with_label_values(&[outcome.as_str()]).inc();
        outcome
    }

    async fn route_verified(&self, envelope: Envelope, origin: Origin) -> RouteOutcome {
        let recovered = match self
            .verifier
            .recover(&envelope.signed_fields(), &envelope.signature)
        {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(
                    ?origin,
                    from = %envelope.from_id,
                    to = %envelope.to_id,
                    error = %e,
                    "Dropping envelope: signature verification failed"
                );
                return RouteOutcome::Dropped(DropReason::InvalidSignature);
            }
        };

        if recovered != envelope.from_id {
            tracing::warn!(
                ?origin,
                claimed = %envelope.from_id,
                recovered = %recovered,
                "Dropping envelope: signature does not match"
            );
            return RouteOutcome::Dropped(DropReason::SignatureMismatch);
        }

        // Snapshot read; the socket write happens after the lock is released
        match self.registry.retrieve(&envelope.to_id).await {
            Ok(record) => {
                let result = deliver_local(
                    envelope.from_id,
                    &envelope.from_name,
                    &record.connection,
                    envelope.from_nonce,
                    envelope.encrypted,
                    &envelope.msg,
                    self.delivery_timeout,
                )
                .await;

                match result {
                    Ok(()) => {
                        tracing::debug!(
                            ?origin,
                            from = %envelope.from_id,
                            to = %envelope.to_id,
                            nonce = envelope.from_nonce,
                            "Delivered locally"
                        );
                        if let Some(observer) = &self.observer {
                            observer.on_delivered(&envelope).await;
                        }
                        RouteOutcome::Delivered
                    }
                    Err(e) => {
                        tracing::error!(
                            ?origin,
                            to = %envelope.to_id,
                            error = %e,
                            "Local delivery failed, dropping message"
                        );
                        if matches!(e, DeliveryError::Timeout { .. }) {
                            // Off the routing path; the read loop deregisters it
                            let connection = record.connection.clone();
                            tokio::spawn(async move { connection.close().await });
                        }
                        RouteOutcome::Dropped(DropReason::DeliveryFailed)
                    }
                }
            }
            Err(_) => match origin {
                Origin::Local => self.publish(envelope).await,
                Origin::Bus => {
                    tracing::info!(
                        to = %envelope.to_id,
                        "Recipient not connected here, dropping bus message"
                    );
                    RouteOutcome::Dropped(DropReason::RecipientAbsent)
                }
            },
        }
    }

    async fn publish(&self, envelope: Envelope) -> RouteOutcome {
        let Some(bus) = &self.bus else {
            tracing::info!(to = %envelope.to_id, "Recipient not connected and no bus configured, dropping");
            return RouteOutcome::Dropped(DropReason::BusDisabled);
        };

        let to = envelope.to_id;
        tracing::info!(to = %to, "Recipient not connected here, publishing to bus");

        match bus.publish(&BusEnvelope::new(self.cap_id, envelope)).await {
            Ok(()) => {
                metrics::BUS_PUBLISHED.inc();
                RouteOutcome::Published
            }
            Err(e) => {
                tracing::error!(to = %to, error = %e, "Bus publish failed, dropping message");
                RouteOutcome::Dropped(DropReason::PublishFailed)
            }
        }
    }
}
