//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cap_relay_node::connection::{Connection, FrameReader, Inbound, ReadFailure, TransportKind};
use cap_relay_node::crypto::{address_from_key, sign_envelope, Secp256k1Verifier, Verifier};
use cap_relay_node::envelope::{BusEnvelope, Envelope, Signature, SignedFields};
use cap_relay_node::error::{BusError, DeliveryError, VerifyError};
use cap_relay_node::identity::PeerId;
use cap_relay_node::Bus;
use k256::ecdsa::SigningKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Deterministic secp256k1 key; `seed` must be non-zero
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub fn address(key: &SigningKey) -> PeerId {
    address_from_key(key.verifying_key())
}

pub fn signed(from: &SigningKey, name: &str, to: PeerId, text: &str, nonce: u64) -> Envelope {
    sign_envelope(from, name, to, vec![text.as_bytes().to_vec()], nonce, false).unwrap()
}

/// Records everything written to it
#[derive(Default)]
pub struct MockConnection {
    pub sent: Mutex<Vec<String>>,
    pub pings: AtomicUsize,
    pub pongs: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub fail_pongs: AtomicBool,
    /// Delay applied inside `close`, after the close signal fires
    pub close_delay: Option<Duration>,
    closed: CancellationToken,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_close_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            close_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeliveryError::Write("broken pipe".to_string()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pong(&self) -> Result<(), DeliveryError> {
        if self.fail_pongs.load(Ordering::SeqCst) {
            return Err(DeliveryError::Write("broken pipe".to_string()));
        }
        self.pongs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Peer whose socket never drains: every write hangs until the future is dropped
#[derive(Default)]
pub struct StalledConnection {
    pub writes: AtomicUsize,
    pub closes: AtomicUsize,
    closed: CancellationToken,
}

impl StalledConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for StalledConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send_text(&self, _text: String) -> Result<(), DeliveryError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        std::future::pending().await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Reader fed from a channel; dropping the sender ends the stream
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Result<Inbound, ReadFailure>>,
}

pub fn channel_reader() -> (mpsc::UnboundedSender<Result<Inbound, ReadFailure>>, ChannelReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelReader { rx })
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, ReadFailure> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(failure)) => Err(failure),
            None => Ok(None),
        }
    }
}

/// Bus that keeps every published envelope
#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<BusEnvelope>>,
    pub fail: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let bus = Self::default();
        bus.fail.store(true, Ordering::SeqCst);
        Arc::new(bus)
    }

    pub fn published(&self) -> Vec<BusEnvelope> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("broker down".to_string()));
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Real verifier that counts how often it is asked
#[derive(Default)]
pub struct CountingVerifier {
    pub calls: AtomicUsize,
}

impl CountingVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Verifier for CountingVerifier {
    fn recover(&self, fields: &SignedFields<'_>, signature: &Signature) -> Result<PeerId, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Secp256k1Verifier.recover(fields, signature)
    }
}
