//! Transport-neutral connection model
//!
//! A registered peer is reached through a [`Connection`] (the write side of
//! its socket) while its read loop consumes a [`FrameReader`]. WebSocket and
//! TCP peers both implement the pair, so the handshake, the read loop and
//! the router never see the underlying transport.

use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;

/// Transport a connection was accepted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Tcp,
}

/// Write capability of a live peer socket
#[async_trait]
pub trait Connection: Send + Sync {
    fn transport(&self) -> TransportKind;

    fn remote_addr(&self) -> Option<SocketAddr>;

    async fn send_text(&self, text: String) -> Result<(), DeliveryError>;

    async fn ping(&self) -> Result<(), DeliveryError>;

    /// Answer a peer ping. Transports that reply on their own keep the default.
    async fn pong(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Close the socket. Must be idempotent and must fire [`Connection::close_signal`].
    async fn close(&self);

    /// Cancelled once the connection is closed; read loops select on it
    fn close_signal(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.close_signal().is_cancelled()
    }
}

pub type ConnectionHandle = Arc<dyn Connection>;

/// A frame read from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// Why a read failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// Socket closed, reset or desynchronised; the read loop must exit
    Critical(String),
    /// Worth logging, the next read may succeed
    Transient(String),
}

impl ReadFailure {
    pub fn is_critical(&self) -> bool {
        matches!(self, ReadFailure::Critical(_))
    }
}

/// Read side of a peer socket
#[async_trait]
pub trait FrameReader: Send {
    /// `Ok(None)` means the peer finished the stream cleanly
    async fn next_frame(&mut self) -> Result<Option<Inbound>, ReadFailure>;
}

/// Classify an I/O error observed while reading
pub fn classify_io_error(err: &std::io::Error) -> ReadFailure {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            ReadFailure::Transient(err.to_string())
        }
        _ => ReadFailure::Critical(err.to_string()),
    }
}

/// Classify an arbitrary error by the first I/O error in its source chain.
/// Errors without an I/O cause (protocol violations and the like) are critical.
pub fn classify_error_chain(err: &(dyn std::error::Error + 'static)) -> ReadFailure {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return match classify_io_error(io) {
                ReadFailure::Transient(_) => ReadFailure::Transient(err.to_string()),
                ReadFailure::Critical(_) => ReadFailure::Critical(err.to_string()),
            };
        }
        current = e.source();
    }

    ReadFailure::Critical(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_error_classification() {
        assert!(classify_io_error(&Error::from(ErrorKind::ConnectionReset)).is_critical());
        assert!(classify_io_error(&Error::from(ErrorKind::UnexpectedEof)).is_critical());
        assert!(classify_io_error(&Error::from(ErrorKind::BrokenPipe)).is_critical());
        assert!(!classify_io_error(&Error::from(ErrorKind::Interrupted)).is_critical());
        assert!(!classify_io_error(&Error::from(ErrorKind::TimedOut)).is_critical());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped: {0}")]
    struct Wrapped(#[source] Error);

    #[derive(Debug, thiserror::Error)]
    #[error("protocol violation")]
    struct Protocol;

    #[test]
    fn test_chain_classification_finds_nested_io_error() {
        let transient = Wrapped(Error::from(ErrorKind::WouldBlock));
        assert!(!classify_error_chain(&transient).is_critical());

        let critical = Wrapped(Error::from(ErrorKind::ConnectionAborted));
        assert!(classify_error_chain(&critical).is_critical());

        assert!(classify_error_chain(&Protocol).is_critical());
    }
}
