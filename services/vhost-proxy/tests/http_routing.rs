
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{roundtrip, spawn_http_proxy, RecordingBackend, TcpEchoBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use vhost_proxy::StaticBackends;

#[tokio::test]
async fn routes_by_host_header() {
    let alpha = RecordingBackend::spawn("alpha").await.unwrap();
    let beta = RecordingBackend::spawn("beta").await.unwrap();

    let backends = StaticBackends::new()
        .route("alpha.example.test", alpha.addr)
        .route("beta.example.test", beta.addr);
    let proxy = spawn_http_proxy(backends).await.unwrap();

    let to_alpha = b"GET /a HTTP/1.1\r\nHost: alpha.example.test\r\n\r\n";
    let to_beta = b"POST /b HTTP/1.1\r\nHost: beta.example.test\r\nContent-Length: 3\r\n\r\nxyz";

    assert_eq!(roundtrip(proxy.local_addr(), to_alpha).await.unwrap(), b"alpha");
    assert_eq!(roundtrip(proxy.local_addr(), to_beta).await.unwrap(), b"beta");

    // Backends see the client's bytes untouched.
    assert_eq!(alpha.received().await, vec![to_alpha.to_vec()]);
    assert_eq!(beta.received().await, vec![to_beta.to_vec()]);
}

#[tokio::test]
async fn host_header_is_normalized() {
    let backend = RecordingBackend::spawn("ok").await.unwrap();
    let proxy = spawn_http_proxy(StaticBackends::new().route("app.example.test", backend.addr))
        .await
        .unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: APP.Example.Test.:8080\r\n\r\n";
    assert_eq!(roundtrip(proxy.local_addr(), request).await.unwrap(), b"ok");
}

#[tokio::test]
async fn unknown_host_uses_default_backend() {
    let routed = RecordingBackend::spawn("routed").await.unwrap();
    let fallback = RecordingBackend::spawn("fallback").await.unwrap();

    let backends = StaticBackends::new()
        .route("known.example.test", routed.addr)
        .default_backend(fallback.addr);
    let proxy = spawn_http_proxy(backends).await.unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: other.example.test\r\n\r\n";
    assert_eq!(roundtrip(proxy.local_addr(), request).await.unwrap(), b"fallback");
    assert!(routed.received().await.is_empty());
}

#[tokio::test]
async fn unknown_host_without_default_is_closed() {
    let proxy = spawn_http_proxy(StaticBackends::new()).await.unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: nowhere.example.test\r\n\r\n";
    if let Ok(response) = roundtrip(proxy.local_addr(), request).await {
        assert!(response.is_empty());
    }

    timeout(Duration::from_secs(2), async {
        while proxy.stats().convert_failed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("conversion failure was not recorded");
}

#[tokio::test]
async fn stream_continues_after_sniffed_request() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = spawn_http_proxy(StaticBackends::new().route("echo.example.test", backend.addr))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();

    let first = b"GET /one HTTP/1.1\r\nHost: echo.example.test\r\n\r\n";
    stream.write_all(first).await.unwrap();
    let mut buf = vec![0u8; first.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, first);

    // Later bytes on the same connection go straight through.
    let second = b"GET /two HTTP/1.1\r\nHost: ignored.example.test\r\n\r\n";
    stream.write_all(second).await.unwrap();
    let mut buf = vec![0u8; second.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, second);

    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn many_concurrent_clients() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = spawn_http_proxy(StaticBackends::new().default_backend(backend.addr))
        .await
        .unwrap();
    let addr = proxy.local_addr();

    let mut clients = Vec::new();
    for i in 0..40 {
        clients.push(tokio::spawn(async move {
            let request = format!("GET /{i} HTTP/1.1\r\nHost: c{i}.example.test\r\n\r\n");
            let response = roundtrip(addr, request.as_bytes()).await.unwrap();
            assert_eq!(response, request.as_bytes());
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    assert_eq!(backend.connection_count(), 40);
    assert_eq!(proxy.stats().connections_accepted.load(Ordering::SeqCst), 40);
}
