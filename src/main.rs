use anyhow::Result;
use cap_relay_node::{CapNode, Config};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting CAP relay node...");

    let config = Config::load()?;
    tracing::info!(
        "Configuration loaded: http={} tcp={} bus={:?}",
        config.http_bind_addr(),
        if config.tcp_config.enabled {
            config.tcp_config.listen_addr.as_str()
        } else {
            "disabled"
        },
        config.bus_config.kind
    );

    let node = CapNode::start(config).await?;
    node.run_until_signal().await
}
