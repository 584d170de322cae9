//! Non-destructive peeking on a duplex stream.
//!
//! A sniffer reads the opening bytes of a connection through a [`Tee`]. Every
//! byte the tee pulls off the raw stream is also queued inside the owning
//! [`PeekBuffer`], and the first regular reads of the `PeekBuffer` hand those
//! bytes out again before any new data from the raw stream. Downstream code
//! sees the connection exactly as the client sent it.
//!
//! ```text
//!            tee() ──► sniffer (HTTP / TLS parser)
//!   raw ─────┤
//!            └─ replay queue ──► PeekBuffer::poll_read ──► backend splice
//! ```

use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Initial capacity of the replay queue.
const INITIAL_REPLAY_CAPACITY: usize = 1024;

/// Replay queue state.
///
/// `Drained` is terminal: once the queued bytes have been handed out the queue
/// is released and never comes back.
#[derive(Debug)]
enum Replay {
    Pending(BytesMut),
    Drained,
}

/// A connection whose sniffed prefix is replayed to the first reader.
#[derive(Debug)]
pub struct PeekBuffer<S> {
    inner: S,
    replay: Mutex<Replay>,
}

impl<S> PeekBuffer<S> {
    /// Wrap a raw connection. Nothing is queued until a [`Tee`] reads.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            replay: Mutex::new(Replay::Pending(BytesMut::with_capacity(
                INITIAL_REPLAY_CAPACITY,
            ))),
        }
    }

    /// Borrow a reader that records everything it reads for later replay.
    ///
    /// The tee borrows the buffer mutably, so sniffing always finishes before
    /// regular reads start. After the replay queue has been drained the tee
    /// still reads from the raw stream but no longer records.
    pub fn tee(&mut self) -> Tee<'_, S> {
        Tee {
            inner: &mut self.inner,
            replay: &self.replay,
        }
    }

    /// Number of sniffed bytes still waiting to be replayed.
    pub fn replay_len(&self) -> usize {
        match &*lock(&self.replay) {
            Replay::Pending(queued) => queued.len(),
            Replay::Drained => 0,
        }
    }

    /// Whether the replay queue has been retired.
    pub fn is_drained(&self) -> bool {
        matches!(*lock(&self.replay), Replay::Drained)
    }

    /// Reference to the raw connection.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn lock(replay: &Mutex<Replay>) -> MutexGuard<'_, Replay> {
    // The queue holds plain bytes; a panic elsewhere cannot leave it torn.
    replay.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekBuffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        {
            let mut replay = lock(&this.replay);
            if let Replay::Pending(queued) = &mut *replay {
                if !queued.is_empty() {
                    let n = queued.len().min(buf.remaining());
                    buf.put_slice(&queued[..n]);
                    queued.advance(n);
                    if queued.is_empty() {
                        trace!("replay queue drained");
                        *replay = Replay::Drained;
                    }
                    return Poll::Ready(Ok(()));
                }
                // Nothing was sniffed (or it is all gone): retire the queue and
                // fall through, an empty read here would look like EOF.
                *replay = Replay::Drained;
            }
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekBuffer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Recording reader handed to sniffers by [`PeekBuffer::tee`].
#[derive(Debug)]
pub struct Tee<'a, S> {
    inner: &'a mut S,
    replay: &'a Mutex<Replay>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Tee<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;

        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            if let Replay::Pending(queued) = &mut *lock(this.replay) {
                queued.extend_from_slice(fresh);
            }
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_peeked_bytes_are_replayed_first() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
        let mut peek = PeekBuffer::new(raw);

        let mut head = [0u8; 3];
        peek.tee().read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"GET");
        assert_eq!(peek.replay_len(), 3);

        let mut all = Vec::new();
        peek.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, raw);
        assert!(peek.is_drained());
    }

    #[tokio::test]
    async fn test_buffered_sniffer_over_read_is_replayed() {
        let raw: &[u8] = b"first line\nsecond line\nbody";
        let mut peek = PeekBuffer::new(raw);

        {
            // BufReader pulls as much as it can, not just the first line.
            let mut reader = BufReader::new(peek.tee());
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "first line\n");
        }
        assert_eq!(peek.replay_len(), raw.len());

        let mut all = Vec::new();
        peek.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, raw);
    }

    #[tokio::test]
    async fn test_small_reads_drain_queue_in_order() {
        let raw: &[u8] = b"abcdefgh";
        let mut peek = PeekBuffer::new(raw);

        let mut sniffed = [0u8; 6];
        peek.tee().read_exact(&mut sniffed).await.unwrap();

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = peek.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn test_no_peek_falls_through_to_raw() {
        let raw: &[u8] = b"untouched";
        let mut peek = PeekBuffer::new(raw);

        let mut all = Vec::new();
        peek.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, raw);
        assert!(peek.is_drained());
    }

    #[tokio::test]
    async fn test_fragmented_raw_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(b"GE")
            .read(b"T /")
            .read(b" HTTP/1.0\r\n")
            .build();
        let mut peek = PeekBuffer::new(mock);

        let mut sniffed = [0u8; 4];
        peek.tee().read_exact(&mut sniffed).await.unwrap();
        assert_eq!(&sniffed, b"GET ");

        let mut all = Vec::new();
        peek.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET / HTTP/1.0\r\n");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut peek = PeekBuffer::new(client);

        peek.write_all(b"pong").await.unwrap();
        peek.flush().await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    proptest! {
        #[test]
        fn prop_tee_then_read_reproduces_stream(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
            chunk in 1usize..512,
        ) {
            let split = split.min(data.len());
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();

            let out = runtime.block_on(async {
                let mut peek = PeekBuffer::new(&data[..]);
                let mut sniffed = vec![0u8; split];
                peek.tee().read_exact(&mut sniffed).await.unwrap();

                let mut out = Vec::new();
                let mut buf = vec![0u8; chunk];
                loop {
                    let n = peek.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                out
            });

            prop_assert_eq!(out, data);
        }
    }
}
