//! Connection Registry
//!
//! Tracks which peer identities have a live, handshaken connection on this
//! node.
//!
//! ## Responsibilities
//! - Exactly one connection per `PeerId`; a second registration is refused
//! - Ping/pong timestamps for the liveness probe and grooming sweep
//! - Point-in-time snapshots so callers never hold the lock across network I/O

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{ConnectionHandle, TransportKind};
use crate::error::RegistryError;
use crate::identity::PeerId;

/// A registered peer connection and its liveness timestamps
#[derive(Clone)]
pub struct ConnectionRecord {
    pub id: PeerId,
    /// Display name announced during the handshake
    pub name: String,
    /// Distinguishes this registration from earlier or later ones for the same id
    pub session: Uuid,
    pub connection: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Most recent sign of life: the last pong, or the handshake itself
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_pong
            .map_or(self.connected_at, |pong| pong.max(self.connected_at))
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id,
            name: self.name.clone(),
            transport: self.connection.transport(),
            connected_at: self.connected_at,
            last_ping: self.last_ping,
            last_pong: self.last_pong,
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("session", &self.session)
            .field("transport", &self.connection.transport())
            .field("connected_at", &self.connected_at)
            .field("last_ping", &self.last_ping)
            .field("last_pong", &self.last_pong)
            .finish()
    }
}

/// Serializable view of a record for the `/peers` endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: PeerId,
    pub name: String,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
}

/// Concurrent map of peer identity to live connection
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<RwLock<HashMap<PeerId, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Fails with `AlreadyConnected` without touching
    /// the existing entry.
    pub async fn add(
        &self,
        id: PeerId,
        name: impl Into<String>,
        connection: ConnectionHandle,
    ) -> Result<ConnectionRecord, RegistryError> {
        let mut peers = self.peers.write().await;

        if peers.contains_key(&id) {
            return Err(RegistryError::AlreadyConnected(id));
        }

        let record = ConnectionRecord {
            id,
            name: name.into(),
            session: Uuid::new_v4(),
            connection,
            connected_at: Utc::now(),
            last_ping: None,
            last_pong: None,
        };
        peers.insert(id, record.clone());

        crate::metrics::CONNECTIONS_ACTIVE.set(peers.len() as i64);
        tracing::debug!(peer = %id, total = peers.len(), "Connection registered");

        Ok(record)
    }

    pub async fn update_last_ping(&self, id: &PeerId) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        let record = peers.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.last_ping = Some(Utc::now());
        Ok(())
    }

    /// Record a pong and return the updated record
    pub async fn update_last_pong(&self, id: &PeerId) -> Result<ConnectionRecord, RegistryError> {
        let mut peers = self.peers.write().await;
        let record = peers.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.last_pong = Some(Utc::now());
        Ok(record.clone())
    }

    /// Remove an identity. Removing an absent identity is a logged no-op.
    pub async fn remove(&self, id: &PeerId) -> Option<ConnectionRecord> {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(id);

        match &removed {
            Some(_) => {
                crate::metrics::CONNECTIONS_ACTIVE.set(peers.len() as i64);
                tracing::debug!(peer = %id, total = peers.len(), "Connection removed");
            }
            None => tracing::debug!(peer = %id, "Remove requested for unknown peer"),
        }

        removed
    }

    /// Remove `id` only if it is still registered under `session`
    pub async fn remove_session(&self, id: &PeerId, session: Uuid) -> bool {
        let mut peers = self.peers.write().await;

        match peers.get(id) {
            Some(record) if record.session == session => {
                peers.remove(id);
                crate::metrics::CONNECTIONS_ACTIVE.set(peers.len() as i64);
                tracing::debug!(peer = %id, total = peers.len(), "Connection removed");
                true
            }
            Some(_) => {
                tracing::debug!(peer = %id, "Session already replaced, leaving current entry");
                false
            }
            None => false,
        }
    }

    pub async fn retrieve(&self, id: &PeerId) -> Result<ConnectionRecord, RegistryError> {
        self.peers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Point-in-time copy of every record
    pub async fn snapshot(&self) -> HashMap<PeerId, ConnectionRecord> {
        self.peers.read().await.clone()
    }

    pub async fn summaries(&self) -> Vec<PeerSummary> {
        let mut list: Vec<PeerSummary> = self
            .snapshot()
            .await
            .values()
            .map(ConnectionRecord::summary)
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
