//! Raw TCP transport
//!
//! Frames are length-prefixed:
//!
//! ```text
//! ┌──────────────┬──────┬───────────────┐
//! │ len: u32 BE  │ kind │ payload       │   len = 1 + payload.len()
//! └──────────────┴──────┴───────────────┘
//! kind: 1 text (UTF-8), 2 ping, 3 pong, 4 close
//! ```
//!
//! A zero or oversized length leaves the stream unsynchronised and is a
//! critical read failure. An unknown kind or non UTF-8 text is consumed in
//! full and reported as transient.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    classify_io_error, Connection, FrameReader, Inbound, ReadFailure, TransportKind,
};
use crate::error::DeliveryError;
use crate::lifecycle::LifecycleManager;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Text = 1,
    Ping = 2,
    Pong = 3,
    Close = 4,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameKind::Text),
            2 => Some(FrameKind::Ping),
            3 => Some(FrameKind::Pong),
            4 => Some(FrameKind::Close),
            _ => None,
        }
    }
}

pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(payload);
    buf
}

pub struct TcpConnection {
    writer: Mutex<OwnedWriteHalf>,
    remote: Option<SocketAddr>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl TcpConnection {
    async fn write_frame(&self, kind: FrameKind, payload: &[u8]) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        let frame = encode_frame(kind, payload);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        self.write_frame(FrameKind::Text, text.as_bytes()).await
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.write_frame(FrameKind::Ping, &[]).await
    }

    async fn pong(&self) -> Result<(), DeliveryError> {
        self.write_frame(FrameKind::Pong, &[]).await
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        let Ok(mut writer) = tokio::time::timeout(CLOSE_STEP_TIMEOUT, self.writer.lock()).await
        else {
            tracing::debug!(remote = ?self.remote, "Writer busy, abandoning close frame");
            return;
        };
        let frame = encode_frame(FrameKind::Close, &[]);
        let _ = tokio::time::timeout(CLOSE_STEP_TIMEOUT, writer.write_all(&frame)).await;
        let _ = tokio::time::timeout(CLOSE_STEP_TIMEOUT, writer.shutdown()).await;
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

pub struct TcpReader {
    reader: BufReader<OwnedReadHalf>,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameReader for TcpReader {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, ReadFailure> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(classify_io_error(&e)),
        };

        if len == 0 || len > self.max_frame_bytes + 1 {
            return Err(ReadFailure::Critical(format!(
                "Invalid frame length {} (max {})",
                len,
                self.max_frame_bytes + 1
            )));
        }

        let mut buf = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut buf).await {
            // A partial frame cannot be resynchronised
            return Err(ReadFailure::Critical(e.to_string()));
        }

        let payload = buf.split_off(1);
        match FrameKind::from_byte(buf[0]) {
            Some(FrameKind::Text) => String::from_utf8(payload)
                .map(|text| Some(Inbound::Text(text)))
                .map_err(|_| ReadFailure::Transient("Text frame is not valid UTF-8".to_string())),
            Some(FrameKind::Ping) => Ok(Some(Inbound::Ping)),
            Some(FrameKind::Pong) => Ok(Some(Inbound::Pong)),
            Some(FrameKind::Close) => Ok(Some(Inbound::Close)),
            None => Err(ReadFailure::Transient(format!("Unknown frame kind {}", buf[0]))),
        }
    }
}

/// Split an accepted or dialed stream into its write handle and reader
pub fn split_stream(stream: TcpStream, max_frame_bytes: usize) -> (Arc<TcpConnection>, TcpReader) {
    let remote = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let connection = Arc::new(TcpConnection {
        writer: Mutex::new(write_half),
        remote,
        closing: AtomicBool::new(false),
        closed: CancellationToken::new(),
    });
    let reader = TcpReader {
        reader: BufReader::new(read_half),
        max_frame_bytes,
    };
    (connection, reader)
}

/// Dial a node's TCP listener; the returned pair speaks the same framing
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    max_frame_bytes: usize,
) -> io::Result<(Arc<TcpConnection>, TcpReader)> {
    let stream = TcpStream::connect(addr).await?;
    Ok(split_stream(stream, max_frame_bytes))
}

/// Accept TCP peers until shutdown begins
pub async fn run_listener(
    listener: TcpListener,
    lifecycle: Arc<LifecycleManager>,
    max_frame_bytes: usize,
) {
    let shutdown = lifecycle.shutdown_token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("TCP listener on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(remote = %addr, "TCP connection accepted");
                let (connection, reader) = split_stream(stream, max_frame_bytes);
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move {
                    let _ = lifecycle.serve_connection(connection, reader).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    tracing::info!("TCP listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(max: usize) -> (TcpStream, TcpReader) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_conn, reader) = split_stream(server, max);
        (client, reader)
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(FrameKind::Text, b"hi");
        assert_eq!(frame, vec![0, 0, 0, 3, 1, b'h', b'i']);

        let ping = encode_frame(FrameKind::Ping, &[]);
        assert_eq!(ping, vec![0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_reader_decodes_frames_in_order() {
        let (mut client, mut reader) = pair(DEFAULT_MAX_FRAME_BYTES).await;

        let mut bytes = encode_frame(FrameKind::Text, b"hello");
        bytes.extend(encode_frame(FrameKind::Pong, &[]));
        bytes.extend(encode_frame(FrameKind::Close, &[]));
        client.write_all(&bytes).await.unwrap();

        assert_eq!(reader.next_frame().await, Ok(Some(Inbound::Text("hello".into()))));
        assert_eq!(reader.next_frame().await, Ok(Some(Inbound::Pong)));
        assert_eq!(reader.next_frame().await, Ok(Some(Inbound::Close)));

        drop(client);
        assert_eq!(reader.next_frame().await, Ok(None));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_transient_and_stream_stays_in_sync() {
        let (mut client, mut reader) = pair(DEFAULT_MAX_FRAME_BYTES).await;

        let mut bytes = vec![0, 0, 0, 2, 9, 0xff];
        bytes.extend(encode_frame(FrameKind::Text, b"next"));
        client.write_all(&bytes).await.unwrap();

        let err = reader.next_frame().await.unwrap_err();
        assert!(!err.is_critical());
        assert_eq!(reader.next_frame().await, Ok(Some(Inbound::Text("next".into()))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_critical() {
        let (mut client, mut reader) = pair(8).await;

        client.write_all(&encode_frame(FrameKind::Text, &[b'a'; 32])).await.unwrap();

        let err = reader.next_frame().await.unwrap_err();
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_zero_length_is_critical() {
        let (mut client, mut reader) = pair(DEFAULT_MAX_FRAME_BYTES).await;

        client.write_all(&[0, 0, 0, 0]).await.unwrap();

        assert!(reader.next_frame().await.unwrap_err().is_critical());
    }
}
