//! Backend selection.
//!
//! A [`BackendSelector`] turns the sniffed start of a connection into an open
//! backend stream. [`StaticBackends`] is the table-driven implementation the
//! binary uses:
//! - Routing key is the HTTP `Host` header or the TLS SNI name
//! - Keys are normalized (lowercase, no trailing dot, no port)
//! - Unknown hosts go to the default backend if one is configured
//! - Connect timeout to backend: 2s default

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use vhost_sniff::{ClientHello, Request};

use super::BoxedStream;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// What a converter learned from the first bytes of a connection.
#[derive(Debug, Clone, Copy)]
pub enum Sniffed<'a> {
    /// A parsed HTTP request head.
    Http(&'a Request),
    /// A parsed TLS ClientHello.
    Tls(&'a ClientHello),
}

impl Sniffed<'_> {
    /// Raw routing key: the `Host` header or the SNI server name.
    pub fn host(&self) -> Option<&str> {
        match self {
            Sniffed::Http(request) => request.host(),
            Sniffed::Tls(hello) => hello.server_name(),
        }
    }

    /// Short protocol label for logs.
    pub fn protocol(&self) -> &'static str {
        match self {
            Sniffed::Http(_) => "http",
            Sniffed::Tls(_) => "tls",
        }
    }
}

/// Opens a backend connection for a sniffed client.
///
/// Errors are treated as transient and retried by the converter.
#[async_trait]
pub trait BackendSelector: Send + Sync {
    async fn select(&self, sniffed: &Sniffed<'_>) -> io::Result<BoxedStream>;
}

/// Normalize a host name for table lookup.
///
/// Lowercases, drops a `:port` suffix, unwraps `[v6]` literals and trims a
/// trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let host = if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080 or [::1]
        rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            // A single colon is a port separator; more than one is a bare v6 literal.
            Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                name
            }
            _ => host,
        }
    };

    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Static host table with an optional fallback backend.
#[derive(Debug, Clone)]
pub struct StaticBackends {
    routes: HashMap<String, SocketAddr>,
    default: Option<SocketAddr>,
    connect_timeout: Duration,
}

impl Default for StaticBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticBackends {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            default: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Route `host` to `addr`.
    pub fn route(mut self, host: &str, addr: SocketAddr) -> Self {
        self.routes.insert(normalize_host(host), addr);
        self
    }

    /// Backend for hosts without a route.
    pub fn default_backend(mut self, addr: SocketAddr) -> Self {
        self.default = Some(addr);
        self
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Number of explicit routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no explicit routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a raw routing key to a backend address.
    pub fn lookup(&self, host: Option<&str>) -> Option<SocketAddr> {
        host.map(normalize_host)
            .and_then(|host| self.routes.get(&host).copied())
            .or(self.default)
    }

    async fn try_connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        debug!(backend_addr = %addr, "Connecting to backend");

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

#[async_trait]
impl BackendSelector for StaticBackends {
    async fn select(&self, sniffed: &Sniffed<'_>) -> io::Result<BoxedStream> {
        let host = sniffed.host();
        let addr = self.lookup(host).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no backend for host {:?}", host.unwrap_or("")),
            )
        })?;

        let stream = self.try_connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY on backend");
        }
        Ok(Box::new(stream))
    }
}
