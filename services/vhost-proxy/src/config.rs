//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vhost_proxy::{ProxyConfig, RetryPolicy};

/// Which converter the listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Route on the HTTP `Host` header.
    Http,
    /// Route on `Host` and rewrite request heads.
    Rewrite,
    /// Route on TLS SNI.
    Tls,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Mode::Http),
            "rewrite" => Ok(Mode::Rewrite),
            "tls" => Ok(Mode::Tls),
            other => bail!("unknown mode {other:?} (expected http, rewrite or tls)"),
        }
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on (example: 127.0.0.1:9999).
    pub listen_addr: SocketAddr,

    /// Converter to run.
    pub mode: Mode,

    /// Host to backend routes.
    pub routes: Vec<(String, SocketAddr)>,

    /// Backend for hosts without a route.
    pub default_backend: Option<SocketAddr>,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Backend selection attempts per connection.
    pub retry_attempts: u32,

    /// Delay before the first backend retry.
    pub retry_base: Duration,

    /// Admission queue capacity.
    pub queue_capacity: usize,

    /// Limit on sniffing the first request or ClientHello.
    pub sniff_timeout: Option<Duration>,

    /// Idle timeout for spliced connections.
    pub idle_timeout: Option<Duration>,

    /// Replacement request URI in rewrite mode.
    pub rewrite_uri: Option<String>,

    /// Headers set on every request in rewrite mode.
    pub rewrite_headers: Vec<(String, String)>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("VHOST_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9999".to_string())
            .parse()
            .context("VHOST_LISTEN_ADDR must be a socket address (host:port).")?;

        let mode = std::env::var("VHOST_MODE")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("VHOST_MODE is invalid.")?
            .unwrap_or(Mode::Http);

        let routes = std::env::var("VHOST_ROUTES")
            .ok()
            .map(|v| parse_routes(&v))
            .transpose()
            .context("VHOST_ROUTES must look like host=addr,host=addr.")?
            .unwrap_or_default();

        let default_backend = std::env::var("VHOST_DEFAULT_BACKEND")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("VHOST_DEFAULT_BACKEND must be a socket address (host:port).")?;

        let connect_timeout = Duration::from_millis(
            env_number("VHOST_CONNECT_TIMEOUT_MS")?
                .unwrap_or(2000)
                .max(1),
        );

        let retry_attempts: u32 = env_number("VHOST_RETRY_ATTEMPTS")?.unwrap_or(5).max(1);

        let retry_base = Duration::from_millis(env_number("VHOST_RETRY_BASE_MS")?.unwrap_or(10));

        let queue_capacity: usize = env_number("VHOST_QUEUE_CAPACITY")?.unwrap_or(15).max(1);

        let sniff_timeout = env_number("VHOST_SNIFF_TIMEOUT_MS")?.map(Duration::from_millis);

        let idle_timeout = env_number("VHOST_IDLE_TIMEOUT_MS")?.map(Duration::from_millis);

        let rewrite_uri = std::env::var("VHOST_REWRITE_URI")
            .ok()
            .filter(|v| !v.is_empty());

        let rewrite_headers = std::env::var("VHOST_REWRITE_HEADERS")
            .ok()
            .map(|v| parse_headers(&v))
            .transpose()
            .context("VHOST_REWRITE_HEADERS must look like \"Key: Value;Key: Value\".")?
            .unwrap_or_default();

        let log_level = std::env::var("VHOST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            mode,
            routes,
            default_backend,
            connect_timeout,
            retry_attempts,
            retry_base,
            queue_capacity,
            sniff_timeout,
            idle_timeout,
            rewrite_uri,
            rewrite_headers,
            log_level,
        })
    }

    /// Library-level proxy settings.
    pub fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.listen_addr);
        config.name = format!("vhost-{:?}", self.mode).to_lowercase();
        config.queue_capacity = self.queue_capacity;
        config.sniff_timeout = self.sniff_timeout;
        config.idle_timeout = self.idle_timeout;
        config.retry = RetryPolicy {
            max_attempts: self.retry_attempts,
            base: self.retry_base,
            ..RetryPolicy::default()
        };
        config
    }
}

fn env_number<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer."))
}

fn parse_routes(value: &str) -> Result<Vec<(String, SocketAddr)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, addr) = entry
                .split_once('=')
                .with_context(|| format!("route {entry:?} is missing '='"))?;
            let addr = addr
                .trim()
                .parse()
                .with_context(|| format!("route {entry:?} has an invalid address"))?;
            Ok((host.trim().to_string(), addr))
        })
        .collect()
}

fn parse_headers(value: &str) -> Result<Vec<(String, String)>> {
    value
        .split(';')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (key, val) = entry
                .split_once(':')
                .with_context(|| format!("header {entry:?} is missing ':'"))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("header {entry:?} has an empty name");
            }
            Ok((key.to_string(), val.trim().to_string()))
        })
        .collect()
}
