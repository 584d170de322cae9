//! Connection converters.
//!
//! A converter takes a freshly accepted client connection, sniffs enough of
//! it to pick a backend, and returns the (client, backend) pair to splice.
//! The sniffed bytes are never lost: the client side handed back replays them
//! before any new data.
//!
//! Variants:
//! - [`HttpHostConverter`]: routes on the HTTP `Host` header
//! - [`HttpRewriteConverter`]: same routing, request heads rewritten in flight
//! - [`TlsSniConverter`]: routes on the TLS SNI server name

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::BufReader;
use tracing::debug;
use vhost_sniff::{
    read_client_hello, read_request, ClientHello, HttpError, PeekBuffer, Request,
    RequestRewriter, RewriteHook, TlsError,
};

use super::backend::{BackendSelector, Sniffed};
use super::retry::RetryPolicy;
use super::BoxedStream;

/// Why a connection could not be converted.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("http sniff failed: {0}")]
    Http(#[from] HttpError),

    #[error("tls sniff failed: {0}")]
    Tls(#[from] TlsError),

    #[error("sniff timed out after {0:?}")]
    SniffTimeout(Duration),

    #[error("no backend for host {host:?} after {attempts} attempts")]
    Backend {
        host: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Settings shared by every converter.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Upper bound on sniffing the first request or record. `None` waits forever.
    pub sniff_timeout: Option<Duration>,
    /// Backend selection retry policy.
    pub retry: RetryPolicy,
}

/// Turns one client connection into a (client, backend) pair.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn convert(&self, conn: BoxedStream) -> Result<(BoxedStream, BoxedStream), ConvertError>;
}

/// Routes plain HTTP on the `Host` header of the first request.
pub struct HttpHostConverter {
    selector: Arc<dyn BackendSelector>,
    options: ConvertOptions,
}

impl HttpHostConverter {
    pub fn new(selector: Arc<dyn BackendSelector>, options: ConvertOptions) -> Self {
        Self { selector, options }
    }
}

#[async_trait]
impl Converter for HttpHostConverter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn convert(&self, conn: BoxedStream) -> Result<(BoxedStream, BoxedStream), ConvertError> {
        let mut peek = PeekBuffer::new(conn);
        let request = within(self.options.sniff_timeout, sniff_request(&mut peek)).await?;

        let backend = connect_backend(
            self.selector.as_ref(),
            &self.options.retry,
            Sniffed::Http(&request),
        )
        .await?;

        Ok((Box::new(peek), backend))
    }
}

/// Routes like [`HttpHostConverter`] and rewrites every request head the
/// client sends with a hook.
///
/// The first request is parsed twice: once to route, once by the rewriter
/// reading it back out of the replay queue.
pub struct HttpRewriteConverter {
    selector: Arc<dyn BackendSelector>,
    hook: RewriteHook,
    options: ConvertOptions,
}

impl HttpRewriteConverter {
    pub fn new(
        selector: Arc<dyn BackendSelector>,
        hook: RewriteHook,
        options: ConvertOptions,
    ) -> Self {
        Self {
            selector,
            hook,
            options,
        }
    }
}

#[async_trait]
impl Converter for HttpRewriteConverter {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    async fn convert(&self, conn: BoxedStream) -> Result<(BoxedStream, BoxedStream), ConvertError> {
        let mut peek = PeekBuffer::new(conn);
        let request = within(self.options.sniff_timeout, sniff_request(&mut peek)).await?;

        let backend = connect_backend(
            self.selector.as_ref(),
            &self.options.retry,
            Sniffed::Http(&request),
        )
        .await?;

        let client = RequestRewriter::with_hook(peek, Arc::clone(&self.hook));
        Ok((Box::new(client), backend))
    }
}

/// Routes TLS on the SNI name of the ClientHello without terminating TLS.
pub struct TlsSniConverter {
    selector: Arc<dyn BackendSelector>,
    options: ConvertOptions,
}

impl TlsSniConverter {
    pub fn new(selector: Arc<dyn BackendSelector>, options: ConvertOptions) -> Self {
        Self { selector, options }
    }
}

#[async_trait]
impl Converter for TlsSniConverter {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn convert(&self, conn: BoxedStream) -> Result<(BoxedStream, BoxedStream), ConvertError> {
        let mut peek = PeekBuffer::new(conn);
        let hello = within(self.options.sniff_timeout, sniff_client_hello(&mut peek)).await?;

        let backend = connect_backend(
            self.selector.as_ref(),
            &self.options.retry,
            Sniffed::Tls(&hello),
        )
        .await?;

        Ok((Box::new(peek), backend))
    }
}

async fn sniff_request(peek: &mut PeekBuffer<BoxedStream>) -> Result<Request, HttpError> {
    // Whatever the BufReader pulls in past the head is recorded by the tee too.
    let mut reader = BufReader::new(peek.tee());
    let request = read_request(&mut reader).await?;

    debug!(
        method = %request.method,
        uri = %request.uri,
        host = request.host().unwrap_or(""),
        content_length = request.content_length,
        "Sniffed HTTP request"
    );
    Ok(request)
}

async fn sniff_client_hello(peek: &mut PeekBuffer<BoxedStream>) -> Result<ClientHello, TlsError> {
    let hello = read_client_hello(&mut peek.tee()).await?;

    debug!(
        server_name = %hello.server_name,
        record_len = hello.length,
        "Sniffed TLS ClientHello"
    );
    Ok(hello)
}

async fn within<T, E, F>(limit: Option<Duration>, fut: F) -> Result<T, ConvertError>
where
    F: Future<Output = Result<T, E>>,
    ConvertError: From<E>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConvertError::SniffTimeout(limit)),
        },
        None => Ok(fut.await?),
    }
}

async fn connect_backend(
    selector: &dyn BackendSelector,
    retry: &RetryPolicy,
    sniffed: Sniffed<'_>,
) -> Result<BoxedStream, ConvertError> {
    match retry.run(|| selector.select(&sniffed)).await {
        Ok(backend) => {
            debug!(
                protocol = sniffed.protocol(),
                host = sniffed.host().unwrap_or(""),
                "Connected to backend"
            );
            Ok(backend)
        }
        Err(e) => Err(ConvertError::Backend {
            host: sniffed.host().unwrap_or("").to_string(),
            attempts: e.attempts,
            source: e.last,
        }),
    }
}
