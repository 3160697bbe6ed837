//! Node assembly
//!
//! Wires the registry, router, bus, lifecycle manager and listeners into a
//! running relay node, and owns the background tasks they spawn.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router as HttpRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::bus::{Bus, BusSubscriber, MemoryBus, MqttBus};
use crate::config::{BusKind, Config};
use crate::crypto::Secp256k1Verifier;
use crate::error::ShutdownError;
use crate::identity::CapId;
use crate::lifecycle::LifecycleManager;
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::storage::{ContactStore, MemoryStore, StoreObserver};
use crate::tcp;
use crate::ws::{ws_handler, HttpState};

/// Bus the node should attach to
pub enum NodeBus {
    /// Build an MQTT client from the configuration
    Mqtt,
    /// Join an existing in-process bus; nodes sharing one reach each other
    Memory(MemoryBus),
    Disabled,
}

pub struct CapNode {
    cap_id: CapId,
    lifecycle: Arc<LifecycleManager>,
    http_addr: SocketAddr,
    tcp_addr: Option<SocketAddr>,
    store: Option<Arc<dyn ContactStore>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CapNode {
    /// Start a node with the bus named by `config`
    pub async fn start(config: Config) -> Result<Self> {
        let bus = match config.bus_config.kind {
            BusKind::Mqtt => NodeBus::Mqtt,
            BusKind::Memory => NodeBus::Memory(MemoryBus::default()),
            BusKind::None => NodeBus::Disabled,
        };
        Self::start_with_bus(config, bus).await
    }

    /// Start with an explicit bus. With `persist_delivered` set, delivered
    /// messages go to a bounded in-memory store reachable through [`CapNode::store`].
    pub async fn start_with_bus(config: Config, bus: NodeBus) -> Result<Self> {
        let store = if config.persist_delivered {
            tracing::info!(
                limit = config.max_stored_messages,
                "Persisting delivered messages to the in-memory store"
            );
            let store = MemoryStore::with_message_limit(config.max_stored_messages);
            Some(Arc::new(store) as Arc<dyn ContactStore>)
        } else {
            None
        };
        Self::launch(config, bus, store).await
    }

    /// Start with a caller-owned store; every local delivery is recorded in it
    pub async fn start_with_store(
        config: Config,
        bus: NodeBus,
        store: Arc<dyn ContactStore>,
    ) -> Result<Self> {
        Self::launch(config, bus, Some(store)).await
    }

    async fn launch(
        config: Config,
        bus: NodeBus,
        store: Option<Arc<dyn ContactStore>>,
    ) -> Result<Self> {
        metrics::init_metrics();

        let cap_id = CapId::generate_and_persist(&config.data_dir)
            .await
            .with_context(|| format!("Failed to write cap id under {}", config.data_dir.display()))?;

        let registry = ConnectionRegistry::new();
        let mut router = Router::new(registry, Arc::new(Secp256k1Verifier), cap_id)
            .with_delivery_timeout(config.delivery_timeout());

        if let Some(store) = &store {
            router = router.with_observer(Arc::new(StoreObserver::new(store.clone())));
        }

        // The subscriber needs the finished router, so the bus is split in two steps
        enum Subscription {
            Mqtt(crate::bus::MqttSubscription),
            Memory(crate::bus::MemorySubscription),
        }

        let subscription = match bus {
            NodeBus::Mqtt => {
                let (mqtt, subscription) = MqttBus::new(config.mqtt(format!("cap-{}", cap_id)));
                tracing::info!(
                    "MQTT bus configured for {}:{} on topic {}",
                    config.bus_config.broker_host,
                    config.bus_config.broker_port,
                    config.bus_config.subject
                );
                router = router.with_bus(Arc::new(mqtt) as Arc<dyn Bus>);
                Some(Subscription::Mqtt(subscription))
            }
            NodeBus::Memory(memory) => {
                let subscription = memory.subscribe();
                router = router.with_bus(Arc::new(memory) as Arc<dyn Bus>);
                Some(Subscription::Memory(subscription))
            }
            NodeBus::Disabled => {
                tracing::info!("Bus disabled, undeliverable messages will be dropped");
                None
            }
        };

        let router = Arc::new(router);
        let lifecycle = Arc::new(LifecycleManager::new(router.clone(), config.lifecycle()));
        let shutdown = lifecycle.shutdown_token();
        let mut tasks = Vec::new();

        if let Some(subscription) = subscription {
            let subscriber = BusSubscriber::new(router.clone());
            let token = shutdown.clone();
            tasks.push(match subscription {
                Subscription::Mqtt(sub) => tokio::spawn(sub.run(subscriber, token)),
                Subscription::Memory(sub) => tokio::spawn(sub.run(subscriber, token)),
            });
        }

        tasks.push(lifecycle.spawn_liveness());

        // HTTP: WebSocket upgrades plus health, metrics and peers
        let listener = TcpListener::bind(config.http_bind_addr())
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", config.http_bind_addr()))?;
        let http_addr = listener.local_addr()?;

        let app = http_router(HttpState {
            lifecycle: lifecycle.clone(),
            max_frame_bytes: config.max_frame_bytes,
        });
        let http_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
            if let Err(e) = served {
                tracing::error!("HTTP server error: {}", e);
            }
        }));
        tracing::info!("HTTP listening on http://{} (WebSocket at /ws)", http_addr);

        // TCP peers
        let tcp_addr = if config.tcp_config.enabled {
            let listener = TcpListener::bind(&config.tcp_config.listen_addr)
                .await
                .with_context(|| {
                    format!("Failed to bind TCP listener on {}", config.tcp_config.listen_addr)
                })?;
            let addr = listener.local_addr()?;
            tasks.push(tokio::spawn(tcp::run_listener(
                listener,
                lifecycle.clone(),
                config.max_frame_bytes,
            )));
            Some(addr)
        } else {
            tracing::info!("TCP listener disabled");
            None
        };

        tracing::info!(cap_id = %cap_id, "Relay node started");

        Ok(Self {
            cap_id,
            lifecycle,
            http_addr,
            tcp_addr,
            store,
            tasks,
        })
    }

    pub fn cap_id(&self) -> CapId {
        self.cap_id
    }

    pub fn local_http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.lifecycle.registry()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Store receiving delivered messages, if persistence is on
    pub fn store(&self) -> Option<&Arc<dyn ContactStore>> {
        self.store.as_ref()
    }

    /// Close every connection and stop the background tasks
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        let result = self.lifecycle.shutdown().await;

        let deadline = self.lifecycle.config().shutdown_timeout;
        for mut task in self.tasks {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                tracing::warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        tracing::info!(cap_id = %self.cap_id, "Relay node stopped");
        result
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run_until_signal(self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Shutdown signal received");

        if let Err(e) = self.shutdown().await {
            tracing::warn!("{}", e);
        }
        Ok(())
    }
}

pub fn http_router(state: HttpState) -> HttpRouter {
    HttpRouter::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/peers", get(peers_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    if state.lifecycle.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING DOWN")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

/// Currently registered peers
async fn peers_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.lifecycle.registry().summaries().await)
}
