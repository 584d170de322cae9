//! vhost-proxy
//!
//! Virtual-host TCP reverse proxy.
//!
//! This service:
//! - Accepts TCP connections on one listener
//! - Sniffs the HTTP `Host` header or the TLS SNI name without consuming it
//! - Connects to the backend routed for that host, retrying with backoff
//! - Optionally rewrites HTTP request heads on their way to the backend
//! - Splices client and backend together until both sides close

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vhost_proxy::{Request, RewriteHook, StaticBackends, VirtualHostProxy};

mod config;

use config::{Config, Mode};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VHOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vhost-proxy");
    info!(
        listen_addr = %config.listen_addr,
        mode = ?config.mode,
        route_count = config.routes.len(),
        has_default_backend = config.default_backend.is_some(),
        "Configuration loaded"
    );

    let mut backends = StaticBackends::new().with_connect_timeout(config.connect_timeout);
    for (host, addr) in &config.routes {
        backends = backends.route(host, *addr);
    }
    if let Some(addr) = config.default_backend {
        backends = backends.default_backend(addr);
    }
    let backends = Arc::new(backends);

    let proxy_config = config.proxy_config();
    let proxy = match config.mode {
        Mode::Http => VirtualHostProxy::bind_http(proxy_config, backends).await,
        Mode::Rewrite => {
            VirtualHostProxy::bind_rewrite(proxy_config, backends, rewrite_hook(&config)).await
        }
        Mode::Tls => VirtualHostProxy::bind_tls(proxy_config, backends).await,
    }
    .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tokio::select! {
        _ = proxy.start() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Hook that applies the configured URI and header overrides.
fn rewrite_hook(config: &Config) -> RewriteHook {
    let uri = config.rewrite_uri.clone();
    let headers = config.rewrite_headers.clone();

    Arc::new(move |mut request: Request| {
        if let Some(uri) = &uri {
            request.uri = uri.clone();
        }
        for (key, value) in &headers {
            request.set_header(key.as_str(), value.as_str());
        }
        request
    })
}
