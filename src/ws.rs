//! WebSocket transport: axum upgrade handler plus the [`Connection`] /
//! [`FrameReader`] pair over a split socket.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    classify_error_chain, Connection, ConnectionHandle, FrameReader, Inbound, ReadFailure,
    TransportKind,
};
use crate::error::DeliveryError;
use crate::lifecycle::LifecycleManager;

/// Bound on each step of a close so a stuck peer cannot hold up shutdown
const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared by the HTTP routes
#[derive(Clone)]
pub struct HttpState {
    pub lifecycle: Arc<LifecycleManager>,
    pub max_frame_bytes: usize,
}

pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    remote: Option<SocketAddr>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl WsConnection {
    async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()))
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        self.send(Message::Text(text.into())).await
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.send(Message::Ping(Bytes::new())).await
    }

    // axum answers pings automatically, so the default `pong` is kept

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        let Ok(mut sink) = tokio::time::timeout(CLOSE_STEP_TIMEOUT, self.sink.lock()).await else {
            tracing::debug!(remote = ?self.remote, "Sink busy, abandoning close frame");
            return;
        };
        let _ = tokio::time::timeout(CLOSE_STEP_TIMEOUT, sink.send(Message::Close(None))).await;
        let _ = tokio::time::timeout(CLOSE_STEP_TIMEOUT, sink.close()).await;
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, ReadFailure> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(classify_error_chain(&e)),
            Some(Ok(message)) => Ok(Some(match message {
                Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => Inbound::Binary(bytes.to_vec()),
                Message::Ping(_) => Inbound::Ping,
                Message::Pong(_) => Inbound::Pong,
                Message::Close(_) => Inbound::Close,
            })),
        }
    }
}

/// Split an upgraded socket into its write handle and reader
pub fn split_socket(socket: WebSocket, remote: Option<SocketAddr>) -> (ConnectionHandle, WsReader) {
    let (sink, stream) = socket.split();
    let connection: ConnectionHandle = Arc::new(WsConnection {
        sink: Mutex::new(sink),
        remote,
        closing: AtomicBool::new(false),
        closed: CancellationToken::new(),
    });
    (connection, WsReader { stream })
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<HttpState>,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    tracing::debug!(remote = %addr, "WebSocket upgrade");

    let lifecycle = state.lifecycle.clone();
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (connection, reader) = split_socket(socket, Some(addr));
            // Failures are logged and counted inside the lifecycle
            let _ = lifecycle.serve_connection(connection, reader).await;
        })
        .into_response()
}
