//! Connection Lifecycle Manager
//!
//! Owns everything between "socket accepted" and "socket gone":
//! - **Handshake**: `HELLO` greeting, identity frame within a short deadline,
//!   registration, `WELCOME <name>` or `Already Connected`
//! - **Read loop**: one per registered connection, feeding frames to the router
//! - **Liveness**: periodic ping of a registry snapshot plus an optional
//!   grooming sweep that closes connections with no recent pong
//! - **Shutdown**: stop accepting, close every connection concurrently,
//!   wait up to a deadline

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionHandle, FrameReader, Inbound, ReadFailure};
use crate::envelope::IdentityFrame;
use crate::error::{HandshakeError, RegistryError, ShutdownError};
use crate::metrics;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::router::{Origin, Router};

/// Server greeting, sent as soon as the transport is up
pub const GREETING: &str = "HELLO";

/// Sent to a client whose identity is already registered
pub const ALREADY_CONNECTED: &str = "Already Connected";

/// Consecutive transient read failures tolerated before giving up on a socket
const MAX_TRANSIENT_FAILURES: u32 = 16;

/// Upper bound for a single ping write during the liveness probe
const PING_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn welcome(name: &str) -> String {
    format!("WELCOME {}", name)
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a client has to send its identity frame after `HELLO`
    pub handshake_timeout: Duration,
    /// Liveness probe period
    pub ping_interval: Duration,
    /// Close connections without activity for this long; `None` disables grooming
    pub stale_after: Option<Duration>,
    /// Deadline for closing all connections on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_secs(30),
            stale_after: Some(Duration::from_secs(90)),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleManager {
    registry: ConnectionRegistry,
    router: Arc<Router>,
    config: LifecycleConfig,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(router: Arc<Router>, config: LifecycleConfig) -> Self {
        Self {
            registry: router.registry().clone(),
            router,
            config,
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Fires when shutdown starts; accept loops and background tasks watch it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handshake, then read until the connection ends. Handshake failures
    /// close the socket and are returned to the acceptor.
    pub async fn serve_connection<R: FrameReader>(
        &self,
        connection: ConnectionHandle,
        mut reader: R,
    ) -> Result<(), HandshakeError> {
        match self.handshake(&connection, &mut reader).await {
            Ok(record) => {
                metrics::HANDSHAKES.with_label_values(&["ok"]).inc();
                tracing::info!(
                    peer = %record.id,
                    name = %record.name,
                    transport = ?connection.transport(),
                    remote = ?connection.remote_addr(),
                    "Peer connected"
                );
                self.run_read_loop(record, reader).await;
                Ok(())
            }
            Err(e) => {
                metrics::HANDSHAKES.with_label_values(&[handshake_label(&e)]).inc();
                tracing::warn!(remote = ?connection.remote_addr(), error = %e, "Handshake failed");
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Promote a raw connection to a registered one.
    ///
    /// On an identity conflict the client is told `Already Connected` and the
    /// new socket is closed; the existing registration is untouched.
    pub async fn handshake<R: FrameReader + ?Sized>(
        &self,
        connection: &ConnectionHandle,
        reader: &mut R,
    ) -> Result<ConnectionRecord, HandshakeError> {
        if self.is_shutting_down() {
            return Err(HandshakeError::ShuttingDown);
        }

        connection.send_text(GREETING.to_string()).await?;

        let text = tokio::time::timeout(self.config.handshake_timeout, next_text(connection, reader))
            .await
            .map_err(|_| HandshakeError::Timeout {
                timeout_ms: self.config.handshake_timeout.as_millis() as u64,
            })??;

        let identity = IdentityFrame::from_json(&text).map_err(HandshakeError::InvalidIdentity)?;

        let record = match self
            .registry
            .add(identity.id, identity.name.clone(), connection.clone())
            .await
        {
            Ok(record) => record,
            Err(RegistryError::AlreadyConnected(id)) => {
                if let Err(e) = connection.send_text(ALREADY_CONNECTED.to_string()).await {
                    tracing::debug!(peer = %id, error = %e, "Failed to send conflict notice");
                }
                connection.close().await;
                return Err(HandshakeError::AlreadyConnected(id));
            }
            Err(e) => {
                connection.close().await;
                return Err(HandshakeError::Registration(e));
            }
        };

        // Shutdown may have taken its snapshot while we were registering
        if self.is_shutting_down() {
            self.registry.remove_session(&record.id, record.session).await;
            return Err(HandshakeError::ShuttingDown);
        }

        if let Err(e) = connection.send_text(welcome(&identity.name)).await {
            self.registry.remove_session(&record.id, record.session).await;
            return Err(e.into());
        }

        Ok(record)
    }

    /// Read frames until the socket fails, the peer leaves or the connection
    /// is closed locally, then deregister this session.
    pub async fn run_read_loop<R: FrameReader>(&self, record: ConnectionRecord, mut reader: R) {
        let closed = record.connection.close_signal();
        let mut transient_failures = 0u32;

        loop {
            let frame = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    tracing::debug!(peer = %record.id, "Connection closed locally");
                    break;
                }
                frame = reader.next_frame() => frame,
            };

            match frame {
                Ok(Some(Inbound::Text(text))) => {
                    transient_failures = 0;
                    self.router.route_frame(&text, Origin::Local).await;
                }
                Ok(Some(Inbound::Binary(bytes))) => {
                    transient_failures = 0;
                    match String::from_utf8(bytes) {
                        Ok(text) => {
                            self.router.route_frame(&text, Origin::Local).await;
                        }
                        Err(_) => {
                            tracing::warn!(peer = %record.id, "Dropping non UTF-8 binary frame");
                        }
                    }
                }
                Ok(Some(Inbound::Pong)) => {
                    if let Err(e) = self.registry.update_last_pong(&record.id).await {
                        tracing::debug!(peer = %record.id, error = %e, "Pong from unregistered peer");
                    }
                }
                Ok(Some(Inbound::Ping)) => {
                    if let Err(e) = record.connection.pong().await {
                        tracing::debug!(peer = %record.id, error = %e, "Failed to answer ping");
                    }
                }
                Ok(Some(Inbound::Close)) | Ok(None) => {
                    tracing::info!(peer = %record.id, "Peer closed the connection");
                    break;
                }
                Err(ReadFailure::Critical(reason)) => {
                    tracing::info!(peer = %record.id, %reason, "Connection lost");
                    break;
                }
                Err(ReadFailure::Transient(reason)) => {
                    transient_failures += 1;
                    tracing::warn!(peer = %record.id, %reason, attempt = transient_failures, "Transient read failure");
                    if transient_failures > MAX_TRANSIENT_FAILURES {
                        tracing::warn!(peer = %record.id, "Too many transient read failures, closing");
                        break;
                    }
                }
            }
        }

        self.registry.remove_session(&record.id, record.session).await;
        record.connection.close().await;
        tracing::info!(peer = %record.id, "Peer disconnected");
    }

    /// Start the periodic ping + grooming task; it stops when shutdown begins
    pub fn spawn_liveness(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.ping_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.probe_once().await;
                        manager.groom_once().await;
                    }
                }
            }

            tracing::debug!("Liveness task stopped");
        })
    }

    /// Ping every registered connection once. Returns the number of pings sent.
    pub async fn probe_once(&self) -> usize {
        let snapshot = self.registry.snapshot().await;
        let mut sent = 0;

        for (id, record) in snapshot {
            match tokio::time::timeout(PING_WRITE_TIMEOUT, record.connection.ping()).await {
                Ok(Ok(())) => {
                    sent += 1;
                    metrics::PINGS_SENT.inc();
                    if let Err(e) = self.registry.update_last_ping(&id).await {
                        tracing::debug!(peer = %id, error = %e, "Peer left before ping was recorded");
                    }
                }
                Ok(Err(e)) => tracing::debug!(peer = %id, error = %e, "Ping failed"),
                Err(_) => tracing::debug!(peer = %id, "Ping write timed out"),
            }
        }

        tracing::trace!(sent, "Liveness probe complete");
        sent
    }

    /// Close connections whose last activity is older than `stale_after`.
    /// Closes are dispatched to their own tasks; returns how many were dispatched.
    pub async fn groom_once(&self) -> usize {
        let Some(threshold) = self.config.stale_after else {
            return 0;
        };

        let now = Utc::now();
        let mut dispatched = 0;

        for (id, record) in self.registry.snapshot().await {
            let idle = (now - record.last_activity()).to_std().unwrap_or(Duration::ZERO);
            if idle <= threshold {
                continue;
            }

            tracing::info!(peer = %id, idle_secs = idle.as_secs(), "Closing stale connection");
            metrics::STALE_CLOSED.inc();
            dispatched += 1;

            let registry = self.registry.clone();
            tokio::spawn(async move {
                registry.remove_session(&record.id, record.session).await;
                record.connection.close().await;
            });
        }

        dispatched
    }

    /// Stop accepting, close every live connection concurrently and wait up
    /// to the configured deadline. Closes still running at the deadline are
    /// left to finish on their own and reported as an error.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already in progress");
        }
        self.shutdown.cancel();

        let snapshot = self.registry.snapshot().await;
        tracing::info!(connections = snapshot.len(), "Shutting down, closing connections");

        let mut closes = JoinSet::new();
        for (_, record) in snapshot {
            closes.spawn(async move { record.connection.close().await });
        }

        let timeout = self.config.shutdown_timeout;
        let waited = tokio::time::timeout(timeout, async {
            while closes.join_next().await.is_some() {}
        })
        .await;

        match waited {
            Ok(()) => {
                tracing::info!("All connections closed");
                Ok(())
            }
            Err(_) => {
                let pending = closes.len();
                closes.detach_all();
                tracing::warn!(pending, ?timeout, "Shutdown deadline exceeded");
                Err(ShutdownError::DeadlineExceeded { pending, timeout })
            }
        }
    }
}

/// Wait for the first text frame, answering pings and skipping pongs
async fn next_text<R: FrameReader + ?Sized>(
    connection: &ConnectionHandle,
    reader: &mut R,
) -> Result<String, HandshakeError> {
    loop {
        match reader.next_frame().await {
            Ok(Some(Inbound::Text(text))) => return Ok(text),
            Ok(Some(Inbound::Binary(bytes))) => {
                return String::from_utf8(bytes)
                    .map_err(|_| HandshakeError::InvalidIdentity(crate::error::DecodeError::Utf8));
            }
            Ok(Some(Inbound::Ping)) => {
                if let Err(e) = connection.pong().await {
                    tracing::debug!(error = %e, "Failed to answer ping during handshake");
                }
            }
            Ok(Some(Inbound::Pong)) => {}
            Ok(Some(Inbound::Close)) | Ok(None) => return Err(HandshakeError::ConnectionClosed),
            Err(ReadFailure::Critical(_)) => return Err(HandshakeError::ConnectionClosed),
            Err(ReadFailure::Transient(reason)) => {
                tracing::debug!(%reason, "Transient read failure during handshake");
            }
        }
    }
}

fn handshake_label(err: &HandshakeError) -> &'static str {
    match err {
        HandshakeError::Timeout { .. } => "timeout",
        HandshakeError::ConnectionClosed => "closed",
        HandshakeError::InvalidIdentity(_) => "invalid_identity",
        HandshakeError::AlreadyConnected(_) => "already_connected",
        HandshakeError::Registration(_) => "registration_failed",
        HandshakeError::ShuttingDown => "shutting_down",
        HandshakeError::Send(_) => "send_failed",
    }
}
