use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::MqttBusConfig;
use crate::error::{CapError, CapResult};
use crate::lifecycle::LifecycleConfig;
use crate::storage::DEFAULT_MESSAGE_LIMIT;
use crate::tcp::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub http_host: String,
    pub http_port: u16,
    pub tcp_config: TcpConfig,
    pub bus_config: BusConfig,
    pub timing: TimingConfig,
    pub max_frame_bytes: usize,
    pub data_dir: PathBuf,
    pub persist_delivered: bool,
    /// Delivered messages the built-in store retains
    pub max_stored_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Mqtt,
    /// In-process loopback; only nodes sharing the process see each other
    Memory,
    None,
}

impl FromStr for BusKind {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(BusKind::Mqtt),
            "memory" => Ok(BusKind::Memory),
            "none" | "" => Ok(BusKind::None),
            other => Err(CapError::Config(format!(
                "Unknown bus kind '{}', expected mqtt, memory or none",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub kind: BusKind,
    pub broker_host: String,
    pub broker_port: u16,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub handshake_timeout_ms: u64,
    pub ping_interval_secs: u64,
    /// 0 disables grooming
    pub stale_after_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Deadline for one write to a local recipient
    pub delivery_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            tcp_config: TcpConfig {
                enabled: true,
                listen_addr: "0.0.0.0:9090".to_string(),
            },
            bus_config: BusConfig {
                kind: BusKind::Mqtt,
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                subject: "cap/messages".to_string(),
            },
            timing: TimingConfig {
                handshake_timeout_ms: 100,
                ping_interval_secs: 30,
                stale_after_secs: 90,
                shutdown_timeout_secs: 5,
                delivery_timeout_ms: 2000,
            },
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            data_dir: PathBuf::from("./data"),
            persist_delivered: false,
            max_stored_messages: DEFAULT_MESSAGE_LIMIT,
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset or unparseable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable {}={}", key, value);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn load() -> CapResult<Self> {
        let defaults = Self::default();

        let http_host = env::var("CAP_HTTP_HOST").unwrap_or(defaults.http_host);
        let http_port = env_or("CAP_HTTP_PORT", defaults.http_port);

        // TCP peer listener
        let tcp_config = TcpConfig {
            enabled: env_or("CAP_TCP_ENABLED", defaults.tcp_config.enabled),
            listen_addr: env::var("CAP_TCP_ADDR").unwrap_or(defaults.tcp_config.listen_addr),
        };

        // Bus
        let kind = match env::var("CAP_BUS_KIND") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.bus_config.kind,
        };

        let bus_config = BusConfig {
            kind,
            broker_host: env::var("MQTT_BROKER_HOST").unwrap_or(defaults.bus_config.broker_host),
            broker_port: env_or("MQTT_BROKER_PORT", defaults.bus_config.broker_port),
            subject: env::var("CAP_BUS_SUBJECT").unwrap_or(defaults.bus_config.subject),
        };

        let timing = TimingConfig {
            handshake_timeout_ms: env_or(
                "CAP_HANDSHAKE_TIMEOUT_MS",
                defaults.timing.handshake_timeout_ms,
            ),
            ping_interval_secs: env_or("CAP_PING_INTERVAL_SECS", defaults.timing.ping_interval_secs),
            stale_after_secs: env_or("CAP_STALE_AFTER_SECS", defaults.timing.stale_after_secs),
            shutdown_timeout_secs: env_or(
                "CAP_SHUTDOWN_TIMEOUT_SECS",
                defaults.timing.shutdown_timeout_secs,
            ),
            delivery_timeout_ms: env_or(
                "CAP_DELIVERY_TIMEOUT_MS",
                defaults.timing.delivery_timeout_ms,
            ),
        };

        let max_frame_bytes = env_or("CAP_MAX_FRAME_BYTES", defaults.max_frame_bytes);

        let data_dir = env::var("CAP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let persist_delivered = env_or("CAP_PERSIST_DELIVERED", defaults.persist_delivered);
        let max_stored_messages =
            env_or("CAP_MAX_STORED_MESSAGES", defaults.max_stored_messages);

        Ok(Config {
            http_host,
            http_port,
            tcp_config,
            bus_config,
            timing,
            max_frame_bytes,
            data_dir,
            persist_delivered,
            max_stored_messages,
        })
    }

    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            handshake_timeout: Duration::from_millis(self.timing.handshake_timeout_ms),
            // A zero period would make tokio's interval panic
            ping_interval: Duration::from_secs(self.timing.ping_interval_secs.max(1)),
            stale_after: match self.timing.stale_after_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            shutdown_timeout: Duration::from_secs(self.timing.shutdown_timeout_secs),
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.delivery_timeout_ms.max(1))
    }

    pub fn mqtt(&self, client_id: String) -> MqttBusConfig {
        MqttBusConfig {
            broker_host: self.bus_config.broker_host.clone(),
            broker_port: self.bus_config.broker_port,
            client_id,
            topic: self.bus_config.subject.clone(),
            max_packet_size: self.max_frame_bytes.saturating_mul(2),
            ..MqttBusConfig::default()
        }
    }
}
