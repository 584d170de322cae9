//! Virtual-host TCP proxy.
//!
//! This module provides:
//! - Connection admission with a bounded queue
//! - Sniffing of HTTP `Host` headers and TLS SNI without consuming bytes
//! - Backend selection with retry and backoff
//! - Optional in-flight HTTP request rewriting
//! - Bidirectional splicing between client and backend
//!
//! ## Architecture
//!
//! ```text
//! Client -> accept loop -> admission queue -> serve loop -> Converter -> splice
//!                                                             |
//!                                   PeekBuffer + sniffer -> BackendSelector -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use vhost_proxy::{ProxyConfig, StaticBackends, VirtualHostProxy};
//!
//! let backends = StaticBackends::new().route("a.example.test", "127.0.0.1:8080".parse()?);
//! let config = ProxyConfig::new("127.0.0.1:9999".parse()?);
//! let proxy = VirtualHostProxy::bind_http(config, Arc::new(backends)).await?;
//! proxy.start().await?;
//! ```

use tokio::io::{AsyncRead, AsyncWrite};

mod backend;
mod converter;
mod retry;
mod server;
mod splice;

pub use backend::{normalize_host, BackendSelector, Sniffed, StaticBackends, DEFAULT_CONNECT_TIMEOUT};
pub use converter::{
    ConvertError, ConvertOptions, Converter, HttpHostConverter, HttpRewriteConverter,
    TlsSniConverter,
};
pub use retry::{RetryExhausted, RetryPolicy};
pub use server::{
    Acceptor, ProxyConfig, ProxyHandle, ProxyStats, VirtualHostProxy, DEFAULT_QUEUE_CAPACITY,
};
pub use splice::splice;

/// A duplex byte stream the proxy can own and move between tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection, either side of a proxied pair.
pub type BoxedStream = Box<dyn AsyncStream>;
