pub mod bus;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod router;
pub mod storage;
pub mod tcp;
pub mod ws;

// Re-export commonly used types for easier testing
pub use crate::bus::{Bus, BusSubscriber, MemoryBus, MqttBus, MqttBusConfig, SubscriberOutcome};
pub use crate::config::{BusKind, Config};
pub use crate::connection::{Connection, ConnectionHandle, FrameReader, Inbound, ReadFailure, TransportKind};
pub use crate::crypto::{address_from_key, sign_envelope, Secp256k1Verifier, Verifier};
pub use crate::envelope::{BusEnvelope, DeliveredMessage, Envelope, IdentityFrame, Signature, SignedFields};
pub use crate::error::{CapError, CapResult, HandshakeError, RegistryError, ShutdownError};
pub use crate::identity::{CapId, PeerId};
pub use crate::lifecycle::{LifecycleConfig, LifecycleManager};
pub use crate::node::{CapNode, NodeBus};
pub use crate::registry::{ConnectionRecord, ConnectionRegistry, PeerSummary};
pub use crate::router::{DeliveryObserver, DropReason, Origin, RouteOutcome, Router};
pub use crate::storage::{Contact, ContactStore, MemoryStore, StoreObserver, StoredMessage};
