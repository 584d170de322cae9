//! Bidirectional copying between a client and its backend.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::BoxedStream;

const COPY_BUF_SIZE: usize = 8192;

/// Copy client -> backend and backend -> client until the pair is done.
///
/// Each direction runs in its own task and shuts down its destination when
/// its source ends. A clean end-of-stream from the client only half-closes
/// the backend, so a response can still come back. Anything else (the
/// backend finishing, an error, an idle timeout) tears down both directions
/// and drops both streams.
///
/// Returns (bytes_to_backend, bytes_from_backend), counting what was copied
/// even if a direction ended with an error.
pub async fn splice(
    client: BoxedStream,
    backend: BoxedStream,
    idle_timeout: Option<Duration>,
) -> (u64, u64) {
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let to_backend = Arc::new(AtomicU64::new(0));
    let from_backend = Arc::new(AtomicU64::new(0));

    let mut upstream = tokio::spawn(pipe(
        client_read,
        backend_write,
        idle_timeout,
        to_backend.clone(),
        "to_backend",
    ));
    let mut downstream = tokio::spawn(pipe(
        backend_read,
        client_write,
        idle_timeout,
        from_backend.clone(),
        "from_backend",
    ));

    tokio::select! {
        up = &mut upstream => {
            if matches!(up, Ok(true)) {
                // Client half-closed; the backend decides when we are done.
                let _ = (&mut downstream).await;
            } else {
                downstream.abort();
                let _ = (&mut downstream).await;
            }
        }
        _ = &mut downstream => {
            upstream.abort();
            let _ = (&mut upstream).await;
        }
    }

    (
        to_backend.load(Ordering::Relaxed),
        from_backend.load(Ordering::Relaxed),
    )
}

/// Returns true when the source reached a clean end-of-stream.
async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    idle_timeout: Option<Duration>,
    copied: Arc<AtomicU64>,
    direction: &'static str,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let result: io::Result<()> = async {
        loop {
            let read_result = if let Some(timeout) = idle_timeout {
                match tokio::time::timeout(timeout, src.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                src.read(&mut buf).await
            };

            match read_result? {
                0 => return Ok(()),
                n => {
                    dst.write_all(&buf[..n]).await?;
                    copied.fetch_add(n as u64, Ordering::Relaxed);
                }
            }
        }
    }
    .await;

    if let Err(e) = &result {
        debug!(
            direction,
            bytes = copied.load(Ordering::Relaxed),
            error = %e,
            "Copy ended with error"
        );
    }

    if let Err(e) = dst.shutdown().await {
        debug!(direction, error = %e, "Shutdown failed");
    }
    drop(src);

    result.is_ok()
}
