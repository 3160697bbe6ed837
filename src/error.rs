//! Error types for the relay node
//!
//! Every failure the core can observe has a typed variant here. Per-message
//! failures are logged and dropped at the point of detection; only the
//! connection-level and shutdown errors travel further up.

use std::time::Duration;
use thiserror::Error;

use crate::identity::PeerId;

/// Connection registry failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer already connected: {0}")]
    AlreadyConnected(PeerId),

    #[error("Peer not found: {0}")]
    NotFound(PeerId),
}

/// Signature recovery failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Failed to recover public key")]
    RecoveryFailed,
}

/// Wire decoding failures
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid hex in {field}: {reason}")]
    Hex { field: &'static str, reason: String },

    #[error("Invalid length for {field}: expected {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Frame is not valid UTF-8")]
    Utf8,
}

/// Local delivery failures (write to a resolved connection)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Connection closed")]
    Closed,

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Write timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to encode outbound frame: {0}")]
    Encode(String),
}

/// Bus publish failures
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to encode bus envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Handshake failures, reported to whoever accepted the socket
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Identity frame not received within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Invalid identity frame: {0}")]
    InvalidIdentity(#[source] DecodeError),

    #[error("Identity {0} is already connected")]
    AlreadyConnected(PeerId),

    #[error("Registration failed: {0}")]
    Registration(#[source] RegistryError),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Handshake send failed: {0}")]
    Send(#[from] DeliveryError),
}

/// Contact/message store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Contact not found: {0}")]
    ContactNotFound(PeerId),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Shutdown diagnostics
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("Shutdown deadline of {timeout:?} exceeded with {pending} connection(s) still closing")]
    DeadlineExceeded { pending: usize, timeout: Duration },
}

/// Unified node error type
#[derive(Error, Debug)]
pub enum CapError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CapError {
    fn from(err: anyhow::Error) -> Self {
        CapError::Internal(err.to_string())
    }
}

/// Result type alias for node operations
pub type CapResult<T> = Result<T, CapError>;
