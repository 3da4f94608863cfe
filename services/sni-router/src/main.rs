//! sni-router
//!
//! L4 TLS passthrough router for x-ui hosts.
//!
//! This service:
//! - Builds a hostname -> port table from the x-ui inbounds and a local
//!   override file, and rebuilds it every 30s
//! - Accepts TCP connections on :443
//! - Inspects the TLS ClientHello for the SNI hostname
//! - Proxies the untouched byte stream to 127.0.0.1:<port>

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use sni_router::{Config, Listener, LogFormat, RouteCache, RouteTableBuilder, SqliteInboundSource};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    init_tracing(&config);

    info!("Starting sni-router");
    info!(
        db_path = %config.db_path.display(),
        overrides = %config.overrides.display(),
        listen = %config.listen,
        reload_interval_secs = config.reload_interval().as_secs(),
        "Configuration loaded"
    );

    let source = SqliteInboundSource::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let builder = Arc::new(RouteTableBuilder::new(
        Box::new(source),
        config.overrides.clone(),
    ));

    let route_cache = RouteCache::load(builder)
        .await
        .context("Initial route table load failed")?;

    if config.check {
        for (host, port) in route_cache.snapshot().entries() {
            println!("{host} {port}");
        }
        return Ok(());
    }

    let route_cache = Arc::new(route_cache);

    tokio::spawn({
        let route_cache = Arc::clone(&route_cache);
        let period = config.reload_interval();
        async move { route_cache.run_refresh_loop(period).await }
    });

    let listener = Listener::bind(config.listener_config(), route_cache)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    info!(listen = %config.listen, "Server started (SNI proxy)");

    if let Err(e) = Arc::new(listener).run().await {
        error!(error = %e, "Listener stopped");
        return Err(e.into());
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to --log-level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
