//! Storage Module
//!
//! The contact and message store sits above the router: the routing core
//! never calls it directly. Delivered messages reach it through
//! [`StoreObserver`], a [`DeliveryObserver`] the node attaches when
//! persistence is enabled.
//!
//! - **ContactStore**: the narrow capability set the application persists through
//! - **MemoryStore**: in-process implementation keeping the most recent messages
//! - **StoreObserver**: records delivered messages and keeps sender contacts current

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::envelope::Envelope;
use crate::error::StorageError;
use crate::identity::PeerId;
use crate::router::DeliveryObserver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: PeerId,
    pub name: String,
    /// Highest nonce seen from this contact
    pub nonce: u64,
    /// Shared encryption key, once exchanged
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub from: PeerId,
    pub from_name: String,
    pub to: PeerId,
    pub nonce: u64,
    pub encrypted: bool,
    pub blocks: Vec<Vec<u8>>,
    pub received_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            from: envelope.from_id,
            from_name: envelope.from_name.clone(),
            to: envelope.to_id,
            nonce: envelope.from_nonce,
            encrypted: envelope.encrypted,
            blocks: envelope.msg.clone(),
            received_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn query_contact_by_id(&self, id: &PeerId) -> Result<Option<Contact>, StorageError>;

    async fn insert_contact(&self, contact: Contact) -> Result<(), StorageError>;

    async fn insert_message(&self, message: StoredMessage) -> Result<(), StorageError>;

    /// Nonce this application signs its next outgoing message with
    async fn update_app_nonce(&self, nonce: u64) -> Result<(), StorageError>;

    async fn update_contact_nonce(&self, id: &PeerId, nonce: u64) -> Result<(), StorageError>;

    async fn update_contact_key(&self, id: &PeerId, key: Vec<u8>) -> Result<(), StorageError>;

    async fn contacts(&self) -> Result<Vec<Contact>, StorageError>;
}

/// Messages an in-memory store keeps before evicting the oldest
pub const DEFAULT_MESSAGE_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    contacts: HashMap<PeerId, Contact>,
    messages: VecDeque<StoredMessage>,
    app_nonce: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    message_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_message_limit(DEFAULT_MESSAGE_LIMIT)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that keeps at most `limit` messages, dropping the oldest first
    pub fn with_message_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            message_limit: limit.max(1),
        }
    }

    /// Retained messages, oldest first
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.state.read().await.messages.iter().cloned().collect()
    }

    pub async fn app_nonce(&self) -> u64 {
        self.state.read().await.app_nonce
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn query_contact_by_id(&self, id: &PeerId) -> Result<Option<Contact>, StorageError> {
        Ok(self.state.read().await.contacts.get(id).cloned())
    }

    async fn insert_contact(&self, contact: Contact) -> Result<(), StorageError> {
        self.state.write().await.contacts.insert(contact.id, contact);
        Ok(())
    }

    async fn insert_message(&self, message: StoredMessage) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.messages.push_back(message);
        while state.messages.len() > self.message_limit {
            state.messages.pop_front();
        }
        Ok(())
    }

    async fn update_app_nonce(&self, nonce: u64) -> Result<(), StorageError> {
        self.state.write().await.app_nonce = nonce;
        Ok(())
    }

    async fn update_contact_nonce(&self, id: &PeerId, nonce: u64) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let contact = state
            .contacts
            .get_mut(id)
            .ok_or(StorageError::ContactNotFound(*id))?;
        contact.nonce = nonce;
        Ok(())
    }

    async fn update_contact_key(&self, id: &PeerId, key: Vec<u8>) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let contact = state
            .contacts
            .get_mut(id)
            .ok_or(StorageError::ContactNotFound(*id))?;
        contact.key = Some(key);
        Ok(())
    }

    async fn contacts(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().await;
        let mut contacts: Vec<Contact> = state.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(contacts)
    }
}

/// Persists every locally delivered message and upserts its sender
pub struct StoreObserver {
    store: Arc<dyn ContactStore>,
}

impl StoreObserver {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    async fn record(&self, envelope: &Envelope) -> Result<(), StorageError> {
        match self.store.query_contact_by_id(&envelope.from_id).await? {
            None => {
                self.store
                    .insert_contact(Contact {
                        id: envelope.from_id,
                        name: envelope.from_name.clone(),
                        nonce: envelope.from_nonce,
                        key: None,
                    })
                    .await?;
            }
            Some(contact) if envelope.from_nonce > contact.nonce => {
                self.store
                    .update_contact_nonce(&envelope.from_id, envelope.from_nonce)
                    .await?;
            }
            Some(_) => {}
        }

        self.store
            .insert_message(StoredMessage::from_envelope(envelope))
            .await
    }
}

#[async_trait]
impl DeliveryObserver for StoreObserver {
    async fn on_delivered(&self, envelope: &Envelope) {
        if let Err(e) = self.record(envelope).await {
            tracing::warn!(from = %envelope.from_id, error = %e, "Failed to persist delivered message");
        }
    }
}
