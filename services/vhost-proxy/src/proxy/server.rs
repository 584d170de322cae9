//! Listener, admission queue and per-connection handling.
//!
//! - The accept loop pushes every accepted connection into a bounded queue
//!   (15 by default); a full queue stalls accepting
//! - The serve loop pops connections one at a time and spawns a handler task
//!   for each
//! - A handler converts the connection and splices it to its backend
//! - Failures and panics are confined to the connection they happened on

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};
use vhost_sniff::RewriteHook;

use super::backend::BackendSelector;
use super::converter::{
    ConvertError, ConvertOptions, Converter, HttpHostConverter, HttpRewriteConverter,
    TlsSniConverter,
};
use super::retry::RetryPolicy;
use super::splice::splice;
use super::BoxedStream;

/// Default number of accepted connections waiting to be served.
pub const DEFAULT_QUEUE_CAPACITY: usize = 15;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Name used in logs.
    pub name: String,
    /// Admission queue capacity.
    pub queue_capacity: usize,
    /// Limit on sniffing the first request or ClientHello.
    pub sniff_timeout: Option<Duration>,
    /// Idle timeout for spliced connections.
    pub idle_timeout: Option<Duration>,
    /// Backend selection retry policy.
    pub retry: RetryPolicy,
}

impl ProxyConfig {
    /// Create a new proxy configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            name: "vhost".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sniff_timeout: None,
            idle_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            sniff_timeout: self.sniff_timeout,
            retry: self.retry.clone(),
        }
    }
}

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections whose handler finished.
    pub connections_closed: AtomicU64,
    /// Connections dropped because sniffing or backend selection failed.
    pub convert_failed: AtomicU64,
    /// Handlers that panicked.
    pub handler_panics: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Source of client connections.
#[async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (stream, peer_addr) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY on client");
        }
        Ok((Box::new(stream), peer_addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

type Admitted = (BoxedStream, SocketAddr);

/// A virtual-host proxy: one listener, one converter.
pub struct VirtualHostProxy {
    config: ProxyConfig,
    acceptor: Box<dyn Acceptor>,
    converter: Arc<dyn Converter>,
    local_addr: SocketAddr,
    stats: Arc<ProxyStats>,
}

impl VirtualHostProxy {
    /// Build a proxy from an existing acceptor.
    pub fn new(
        config: ProxyConfig,
        acceptor: impl Acceptor,
        converter: Arc<dyn Converter>,
    ) -> io::Result<Self> {
        let local_addr = acceptor.local_addr()?;

        Ok(Self {
            config,
            acceptor: Box::new(acceptor),
            converter,
            local_addr,
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Bind a TCP listener at `config.bind_addr`.
    pub async fn bind(config: ProxyConfig, converter: Arc<dyn Converter>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let proxy = Self::new(config, listener, converter)?;

        info!(
            proxy = %proxy.config.name,
            bind_addr = %proxy.local_addr,
            converter = proxy.converter.name(),
            "Listener bound"
        );

        Ok(proxy)
    }

    /// Route plain HTTP on the `Host` header.
    pub async fn bind_http(
        config: ProxyConfig,
        selector: Arc<dyn BackendSelector>,
    ) -> io::Result<Self> {
        let converter = HttpHostConverter::new(selector, config.convert_options());
        Self::bind(config, Arc::new(converter)).await
    }

    /// Route plain HTTP on the `Host` header and rewrite request heads with `hook`.
    pub async fn bind_rewrite(
        config: ProxyConfig,
        selector: Arc<dyn BackendSelector>,
        hook: RewriteHook,
    ) -> io::Result<Self> {
        let converter = HttpRewriteConverter::new(selector, hook, config.convert_options());
        Self::bind(config, Arc::new(converter)).await
    }

    /// Route TLS on the SNI server name, passing the handshake through.
    pub async fn bind_tls(
        config: ProxyConfig,
        selector: Arc<dyn BackendSelector>,
    ) -> io::Result<Self> {
        let converter = TlsSniConverter::new(selector, config.convert_options());
        Self::bind(config, Arc::new(converter)).await
    }

    /// Get the local address this proxy is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run the proxy until the accept loop ends.
    pub async fn start(self) {
        let Self {
            config,
            mut acceptor,
            converter,
            local_addr,
            stats,
        } = self;

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        info!(
            proxy = %config.name,
            bind_addr = %local_addr,
            converter = converter.name(),
            queue_capacity = config.queue_capacity,
            "Proxy started"
        );

        tokio::join!(
            accept_loop(&mut *acceptor, queue_tx, &stats),
            serve_loop(queue_rx, converter, Arc::clone(&stats), config.idle_timeout),
        );

        info!(proxy = %config.name, "Proxy stopped");
    }

    /// Spawn the proxy and return immediately.
    pub fn async_start(self) -> ProxyHandle {
        let local_addr = self.local_addr;
        let stats = self.stats();
        let task = tokio::spawn(self.start());

        ProxyHandle {
            local_addr,
            stats,
            task,
        }
    }
}

/// Handle to a proxy started with [`VirtualHostProxy::async_start`].
#[derive(Debug)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    stats: Arc<ProxyStats>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Stop accepting. Connections already being handled keep running.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the proxy task to finish.
    pub async fn wait(self) -> Result<(), JoinError> {
        self.task.await
    }

    pub fn into_join_handle(self) -> JoinHandle<()> {
        self.task
    }
}

/// Accept connections into the admission queue until its consumer goes away.
async fn accept_loop<A>(acceptor: &mut A, queue: mpsc::Sender<Admitted>, stats: &ProxyStats)
where
    A: Acceptor + ?Sized,
{
    loop {
        match acceptor.accept().await {
            Ok((stream, peer_addr)) => {
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                debug!(peer_addr = %peer_addr, "Connection accepted");

                // Blocks while the queue is full.
                if queue.send((stream, peer_addr)).await.is_err() {
                    debug!("Admission queue closed");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Spawn one handler per admitted connection.
async fn serve_loop(
    mut queue: mpsc::Receiver<Admitted>,
    converter: Arc<dyn Converter>,
    stats: Arc<ProxyStats>,
    idle_timeout: Option<Duration>,
) {
    while let Some((stream, peer_addr)) = queue.recv().await {
        let converter = Arc::clone(&converter);
        let stats = Arc::clone(&stats);

        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(
            async move {
                let handled = AssertUnwindSafe(handle_connection(
                    stream,
                    peer_addr,
                    converter.as_ref(),
                    &stats,
                    idle_timeout,
                ))
                .catch_unwind()
                .await;

                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                    }
                    Err(panic) => {
                        stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                        error!(
                            peer_addr = %peer_addr,
                            panic = panic_message(panic.as_ref()),
                            "Connection handler panicked"
                        );
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}

/// Handle a single connection.
async fn handle_connection(
    stream: BoxedStream,
    peer_addr: SocketAddr,
    converter: &dyn Converter,
    stats: &ProxyStats,
    idle_timeout: Option<Duration>,
) -> Result<(), ConvertError> {
    debug!(converter = converter.name(), "Handling connection");

    let (client, backend) = match converter.convert(stream).await {
        Ok(pair) => pair,
        Err(e) => {
            stats.convert_failed.fetch_add(1, Ordering::Relaxed);
            warn!(peer_addr = %peer_addr, error = %e, "Failed to convert connection");
            return Err(e);
        }
    };

    let (bytes_to_backend, bytes_from_backend) = splice(client, backend, idle_timeout).await;

    stats
        .bytes_to_backend
        .fetch_add(bytes_to_backend, Ordering::Relaxed);
    stats
        .bytes_from_backend
        .fetch_add(bytes_from_backend, Ordering::Relaxed);

    debug!(
        bytes_to_backend = bytes_to_backend,
        bytes_from_backend = bytes_from_backend,
        "Connection closed"
    );

    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
