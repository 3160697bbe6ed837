use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Connection metrics
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "cap_connections_active",
        "Current number of registered peer connections"
    ).unwrap();

    pub static ref HANDSHAKES: IntCounterVec = IntCounterVec::new(
        Opts::new("cap_handshakes_total", "Total handshakes by result"),
        &["result"]
    ).unwrap();

    pub static ref PINGS_SENT: IntCounter = IntCounter::new(
        "cap_pings_sent_total",
        "Total liveness pings sent"
    ).unwrap();

    pub static ref STALE_CLOSED: IntCounter = IntCounter::new(
        "cap_stale_connections_closed_total",
        "Total connections closed for inactivity"
    ).unwrap();

    // Routing metrics
    pub static ref MESSAGES_ROUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("cap_messages_routed_total", "Total routed envelopes by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref ROUTE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cap_route_duration_seconds",
            "Envelope routing latency in seconds"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    ).unwrap();

    // Bus metrics
    pub static ref BUS_PUBLISHED: IntCounter = IntCounter::new(
        "cap_bus_published_total",
        "Total envelopes published to the bus"
    ).unwrap();

    pub static ref BUS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("cap_bus_received_total", "Total bus payloads received by result"),
        &["result"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(CONNECTIONS_ACTIVE.clone()),
            Box::new(HANDSHAKES.clone()),
            Box::new(PINGS_SENT.clone()),
            Box::new(STALE_CLOSED.clone()),
            Box::new(MESSAGES_ROUTED.clone()),
            Box::new(ROUTE_LATENCY.clone()),
            Box::new(BUS_PUBLISHED.clone()),
            Box::new(BUS_RECEIVED.clone()),
        ];

        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();

        PINGS_SENT.inc();
        MESSAGES_ROUTED.with_label_values(&["delivered"]).inc();

        let text = export_metrics();
        assert!(text.contains("cap_pings_sent_total"));
        assert!(text.contains("cap_messages_routed_total"));
    }
}
