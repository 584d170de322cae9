//! Streaming HTTP request rewriting.
//!
//! [`RequestRewriter`] sits on the client side of a proxied connection. Each
//! request head read from the client is parsed, optionally replaced by a
//! [`RewriteHook`], re-serialized, and followed by the original body bytes,
//! untouched and in bounded chunks. Requests are processed one after another
//! for as long as the client keeps the connection open.
//!
//! The hook never controls body framing: when the original request declared a
//! `Content-Length`, the rewritten head always carries that same value, since
//! the bytes that follow on the wire are the original body.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tracing::{debug, warn};

use crate::http::{HttpError, Request, RequestParser, CONTENT_LENGTH};

/// Largest body chunk copied per production step.
pub const MAX_BODY_CHUNK: usize = 1024;

/// Request substitution applied to every request head.
pub type RewriteHook = Arc<dyn Fn(Request) -> Request + Send + Sync>;

/// Where the rewriter is in the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteState {
    /// Next bytes from the source are a request head.
    NeedHeader,
    /// Body bytes of the current request are still owed.
    NeedBody,
    /// Terminal. Reads drain the output buffer, then report the stored error
    /// (or end-of-stream after a clean close).
    Failed,
}

/// Client-side stream adapter that rewrites request heads in flight.
pub struct RequestRewriter<S> {
    reader: BufReader<S>,
    parser: RequestParser,
    hook: Option<RewriteHook>,
    out: BytesMut,
    body_len: u64,
    state: RewriteState,
    error: Option<Arc<io::Error>>,
}

impl<S: AsyncRead> RequestRewriter<S> {
    /// Wrap a client stream without a hook: heads are re-serialized as parsed.
    pub fn new(inner: S) -> Self {
        Self {
            reader: BufReader::new(inner),
            parser: RequestParser::default(),
            hook: None,
            out: BytesMut::with_capacity(MAX_BODY_CHUNK),
            body_len: 0,
            state: RewriteState::NeedHeader,
            error: None,
        }
    }

    /// Wrap a client stream and rewrite every request head with `hook`.
    pub fn with_hook(inner: S, hook: RewriteHook) -> Self {
        let mut rewriter = Self::new(inner);
        rewriter.hook = Some(hook);
        rewriter
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }
}

impl<S> RequestRewriter<S> {
    /// Install or replace the rewrite hook. Applies from the next request head.
    pub fn set_hook(&mut self, hook: RewriteHook) {
        self.hook = Some(hook);
    }

    pub fn state(&self) -> RewriteState {
        self.state
    }

    /// Body bytes of the current request not yet produced.
    pub fn body_remaining(&self) -> u64 {
        self.body_len
    }

    /// Bytes produced but not yet read.
    pub fn buffered(&self) -> usize {
        self.out.len()
    }

    fn fail(&mut self, err: io::Error) {
        warn!(error = %err, "request rewriting stopped");
        self.error = Some(Arc::new(err));
        self.state = RewriteState::Failed;
    }

    fn emit_head(&mut self, request: Request) {
        let original_len = request.content_length;

        let mut request = match &self.hook {
            Some(hook) => hook(request),
            None => request,
        };

        match original_len {
            Some(len) => {
                request.set_header(CONTENT_LENGTH, len.to_string());
                request.content_length = Some(len);
                self.body_len = u64::from(len);
            }
            None => self.body_len = 0,
        }

        debug!(
            method = %request.method,
            uri = %request.uri,
            body_len = self.body_len,
            "Request head rewritten"
        );

        request.encode(&mut self.out);
        self.state = if self.body_len > 0 {
            RewriteState::NeedBody
        } else {
            RewriteState::NeedHeader
        };
    }
}

impl<S: AsyncRead + Unpin> RequestRewriter<S> {
    /// Produce the next request head into the output buffer.
    fn poll_head(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match ready!(self.parser.poll_parse(Pin::new(&mut self.reader), cx)) {
            Ok(request) => self.emit_head(request),
            Err(HttpError::Closed) => {
                debug!("Client closed between requests");
                self.state = RewriteState::Failed;
            }
            Err(e) => self.fail(e.into()),
        }
        Poll::Ready(())
    }

    /// Copy one chunk of the original body into the output buffer.
    fn poll_body(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let want = self.body_len.min(MAX_BODY_CHUNK as u64) as usize;

        let filled = match ready!(Pin::new(&mut self.reader).poll_fill_buf(cx)) {
            Ok([]) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request body",
            )),
            Ok(available) => {
                let n = available.len().min(want);
                self.out.extend_from_slice(&available[..n]);
                Ok(n)
            }
            Err(e) => Err(e),
        };

        let copied = match filled {
            Ok(n) => n,
            Err(e) => {
                self.fail(e);
                return Poll::Ready(());
            }
        };
        Pin::new(&mut self.reader).consume(copied);

        self.body_len -= copied as u64;
        if self.body_len == 0 {
            self.state = RewriteState::NeedHeader;
        }
        Poll::Ready(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RequestRewriter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.out.is_empty() {
                let n = this.out.len().min(buf.remaining());
                buf.put_slice(&this.out[..n]);
                this.out.advance(n);
                return Poll::Ready(Ok(()));
            }

            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            match this.state {
                RewriteState::Failed => {
                    return Poll::Ready(match &this.error {
                        Some(err) => Err(io::Error::new(err.kind(), Arc::clone(err))),
                        None => Ok(()),
                    });
                }
                RewriteState::NeedHeader => ready!(this.poll_head(cx)),
                RewriteState::NeedBody => ready!(this.poll_body(cx)),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for RequestRewriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().reader.get_mut()).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().reader.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().reader.get_mut()).poll_shutdown(cx)
    }
}

impl<S> fmt::Debug for RequestRewriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRewriter")
            .field("state", &self.state)
            .field("body_len", &self.body_len)
            .field("buffered", &self.out.len())
            .field("hook", &self.hook.is_some())
            .field("error", &self.error)
            .finish()
    }
}
