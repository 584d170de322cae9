//! HTTP/1.x request-head codec.
//!
//! Only what routing and rewriting need: the request line, a flat header
//! collection and the `Content-Length` framing of the body. Chunked transfer
//! encoding and trailers are not understood.
//!
//! Header keys are matched exactly (case-sensitive). Iteration order is the
//! order in which keys were first inserted, so serializing a parsed request
//! reproduces its header order.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

/// Maximum length of a single request or header line (excluding the newline).
pub const MAX_LINE_LEN: usize = 8192;

/// Maximum number of header lines in one request.
pub const MAX_HEADERS: usize = 100;

/// Header carrying the body length.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Header carrying the virtual host.
pub const HOST: &str = "Host";

/// HTTP parse errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request line, header line or Content-Length value.
    #[error("unexpected http message")]
    UnexpectedMessage,

    /// A line did not end within [`MAX_LINE_LEN`] bytes.
    #[error("http line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// More than [`MAX_HEADERS`] header lines.
    #[error("http request has more than {limit} header lines")]
    TooManyHeaders { limit: usize },

    /// The stream ended cleanly before the first byte of a request.
    #[error("connection closed before a request line was read")]
    Closed,

    /// I/O failure, including EOF in the middle of a request head.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<HttpError> for io::Error {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Io(e) => e,
            HttpError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Insertion-ordered header collection with unique, case-sensitive keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header by exact key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a header. An existing key keeps its position and gets the new value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed HTTP request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    /// Declared body length; `None` when the request has no `Content-Length`.
    pub content_length: Option<u32>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        uri: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: version.into(),
            headers: Headers::new(),
            content_length: None,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    /// The `Host` header, if present.
    pub fn host(&self) -> Option<&str> {
        self.header(HOST)
    }

    /// Serialize the request head (request line, headers, blank line).
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.method.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.uri.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.version.as_bytes());
        dst.extend_from_slice(b"\r\n");

        for (key, value) in self.headers.iter() {
            dst.extend_from_slice(key.as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        dst.extend_from_slice(b"\r\n");
    }
}

/// Split a request line into method, URI and version.
///
/// Tokens are separated by exactly one space; anything other than three tokens
/// is rejected.
pub fn parse_request_line(line: &str) -> Result<(String, String, String), HttpError> {
    let parts: Vec<&str> = line.split(' ').collect();
    match parts.as_slice() {
        [method, uri, version] => Ok((
            (*method).to_string(),
            (*uri).to_string(),
            (*version).to_string(),
        )),
        _ => Err(HttpError::UnexpectedMessage),
    }
}

/// Split a header line on the first `": "`.
pub fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    line.split_once(": ")
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or(HttpError::UnexpectedMessage)
}

/// Read the declared body length from the headers.
fn parse_content_length(headers: &Headers) -> Result<Option<u32>, HttpError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };

    match value.parse::<i32>() {
        Ok(len) if len >= 0 => Ok(Some(len as u32)),
        _ => Err(HttpError::UnexpectedMessage),
    }
}

/// Read one line, resuming across polls.
///
/// `line` holds the partial line between polls. Returns `Ok(None)` at EOF; the
/// caller inspects `line` to tell a clean end from a truncated one.
fn poll_read_line<R: AsyncBufRead + ?Sized>(
    mut reader: Pin<&mut R>,
    cx: &mut Context<'_>,
    line: &mut Vec<u8>,
) -> Poll<Result<Option<String>, HttpError>> {
    loop {
        let (done, used) = {
            let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
            if available.is_empty() {
                return Poll::Ready(Ok(None));
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&available[..i]);
                    (true, i + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.as_mut().consume(used);

        if line.len() > MAX_LINE_LEN {
            return Poll::Ready(Err(HttpError::LineTooLong {
                limit: MAX_LINE_LEN,
            }));
        }

        if done {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let bytes = std::mem::take(line);
            let text = String::from_utf8(bytes).map_err(|_| HttpError::UnexpectedMessage)?;
            return Poll::Ready(Ok(Some(text)));
        }
    }
}

/// Incremental request-head parser.
///
/// Keeps the partial line and the partially built request between polls, so a
/// `Pending` from the reader loses nothing.
#[derive(Debug, Default)]
pub(crate) struct RequestParser {
    line: Vec<u8>,
    head: Option<Request>,
    header_lines: usize,
}

impl RequestParser {
    pub(crate) fn poll_parse<R: AsyncBufRead + ?Sized>(
        &mut self,
        mut reader: Pin<&mut R>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Request, HttpError>> {
        loop {
            let at_boundary = self.head.is_none() && self.line.is_empty();

            let line = match ready!(poll_read_line(reader.as_mut(), cx, &mut self.line))? {
                Some(line) => line,
                None if at_boundary => return Poll::Ready(Err(HttpError::Closed)),
                None => {
                    return Poll::Ready(Err(HttpError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside http request head",
                    ))))
                }
            };

            match self.head.take() {
                None => {
                    let (method, uri, version) = parse_request_line(&line)?;
                    self.head = Some(Request::new(method, uri, version));
                    self.header_lines = 0;
                }
                Some(mut request) => {
                    if line.is_empty() {
                        request.content_length = parse_content_length(&request.headers)?;
                        return Poll::Ready(Ok(request));
                    }

                    self.header_lines += 1;
                    if self.header_lines > MAX_HEADERS {
                        return Poll::Ready(Err(HttpError::TooManyHeaders { limit: MAX_HEADERS }));
                    }

                    let (key, value) = parse_header_line(&line)?;
                    request.headers.set(key, value);
                    self.head = Some(request);
                }
            }
        }
    }
}

/// Read one request head from a buffered stream.
///
/// Bytes after the blank line (the body, or the next request) stay in the
/// reader.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, HttpError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut parser = RequestParser::default();
    poll_fn(|cx| parser.poll_parse(Pin::new(&mut *reader), cx)).await
}

/// Write a request head to `sink`, returning the number of bytes written.
pub async fn write_request<W>(request: &Request, sink: &mut W) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(256);
    request.encode(&mut buf);
    sink.write_all(&buf).await?;
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn parse(raw: &[u8]) -> Result<Request, HttpError> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_request_basic() {
        let request = parse(
            b"POST /submit HTTP/1.1\r\nHost: a.example.test\r\nContent-Length: 5\r\nX-Trace: 1\r\n\r\nhello",
        )
        .await
        .unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/submit");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.host(), Some("a.example.test"));
        assert_eq!(request.content_length, Some(5));

        let keys: Vec<&str> = request.headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["Host", "Content-Length", "X-Trace"]);
    }

    #[tokio::test]
    async fn test_body_left_in_reader() {
        let raw: &[u8] = b"PUT /x HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET";
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await.unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bodyGET");
    }

    #[tokio::test]
    async fn test_bare_newlines_accepted() {
        let request = parse(b"GET / HTTP/1.0\nHost: h\n\n").await.unwrap();
        assert_eq!(request.version, "HTTP/1.0");
        assert_eq!(request.host(), Some("h"));
        assert_eq!(request.content_length, None);
    }

    #[tokio::test]
    async fn test_request_line_token_count() {
        let cases: [&[u8]; 4] = [
            b"GET /\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
            b"GET  / HTTP/1.1\r\n\r\n",
            b"\r\n\r\n",
        ];
        for raw in cases {
            assert!(
                matches!(parse(raw).await, Err(HttpError::UnexpectedMessage)),
                "expected rejection for {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[tokio::test]
    async fn test_header_without_delimiter() {
        let result = parse(b"GET / HTTP/1.1\r\nHost:a.test\r\n\r\n").await;
        assert!(matches!(result, Err(HttpError::UnexpectedMessage)));
    }

    #[tokio::test]
    async fn test_header_value_keeps_later_delimiters() {
        let request = parse(b"GET / HTTP/1.1\r\nX-Note: a: b\r\n\r\n").await.unwrap();
        assert_eq!(request.header("X-Note"), Some("a: b"));
    }

    #[tokio::test]
    async fn test_content_length_values() {
        let cases: [(&str, Option<Option<u32>>); 7] = [
            ("0", Some(Some(0))),
            ("1024", Some(Some(1024))),
            ("2147483647", Some(Some(i32::MAX as u32))),
            ("2147483648", None),
            ("-1", None),
            ("12abc", None),
            ("", None),
        ];

        for (value, expected) in cases {
            let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", value);
            let result = parse(raw.as_bytes()).await;
            match expected {
                Some(len) => assert_eq!(result.unwrap().content_length, len, "value {:?}", value),
                None => assert!(
                    matches!(result, Err(HttpError::UnexpectedMessage)),
                    "value {:?} should be rejected",
                    value
                ),
            }
        }
    }

    #[tokio::test]
    async fn test_content_length_lookup_is_case_sensitive() {
        let request = parse(b"POST / HTTP/1.1\r\ncontent-length: 3\r\n\r\n").await.unwrap();
        assert_eq!(request.content_length, None);
    }

    #[tokio::test]
    async fn test_duplicate_header_last_value_wins() {
        let request = parse(b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\nHost: b\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(request.host(), Some("b"));
        let keys: Vec<&str> = request.headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["Host", "Accept"]);
    }

    #[tokio::test]
    async fn test_fragmented_input() {
        let mock = tokio_test::io::Builder::new()
            .read(b"GET /a")
            .read(b"bc HTTP/1.1\r")
            .read(b"\nHo")
            .read(b"st: frag.test\r\n")
            .read(b"\r\n")
            .build();
        let mut reader = BufReader::new(mock);

        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.uri, "/abc");
        assert_eq!(request.host(), Some("frag.test"));
    }

    #[tokio::test]
    async fn test_clean_close_before_request() {
        assert!(matches!(parse(b"").await, Err(HttpError::Closed)));
    }

    #[tokio::test]
    async fn test_eof_inside_head() {
        let result = parse(b"GET / HTTP/1.1\r\nHost: a").await;
        match result {
            Err(HttpError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected unexpected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_LINE_LEN + 1));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");

        let result = parse(&raw).await;
        assert!(matches!(result, Err(HttpError::LineTooLong { .. })));
    }

    #[tokio::test]
    async fn test_too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let result = parse(&raw).await;
        assert!(matches!(result, Err(HttpError::TooManyHeaders { .. })));
    }

    #[tokio::test]
    async fn test_write_then_read_preserves_request() {
        let mut original = Request::new("PATCH", "/items/7?x=1", "HTTP/1.1");
        original.set_header("Host", "api.example.test");
        original.set_header("Content-Length", "11");
        original.set_header("Authorization", "Bearer a: b");
        original.set_header("Accept", "*/*");
        original.content_length = Some(11);

        let mut wire = Vec::new();
        let written = write_request(&original, &mut wire).await.unwrap();
        assert_eq!(written, wire.len());
        assert!(wire.starts_with(b"PATCH /items/7?x=1 HTTP/1.1\r\nHost: api.example.test\r\n"));
        assert!(wire.ends_with(b"Accept: */*\r\n\r\n"));

        let parsed = parse(&wire).await.unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_headers_set_and_remove() {
        let mut headers = Headers::new();
        headers.set("A", "1");
        headers.set("B", "2");
        headers.set("A", "3");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("A"), Some("3"));
        assert_eq!(headers.get("a"), None);

        assert_eq!(headers.remove("A"), Some("3".to_string()));
        assert!(!headers.contains("A"));
        assert_eq!(headers.iter().collect::<Vec<_>>(), [("B", "2")]);
    }

    #[test]
    fn test_error_into_io() {
        let err: io::Error = HttpError::UnexpectedMessage.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err: io::Error = HttpError::Io(io::ErrorKind::BrokenPipe.into()).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    proptest! {
        #[test]
        fn prop_encoded_request_parses_back(
            method in "[A-Z]{1,8}",
            uri in "/[A-Za-z0-9/._-]{0,24}",
            version in "HTTP/1\\.[01]",
            headers in proptest::collection::vec(
                ("X-[A-Za-z0-9-]{1,12}", "[A-Za-z0-9._/-]{0,24}"),
                0..16,
            ),
            content_length in proptest::option::of(0u32..=i32::MAX as u32),
        ) {
            let mut original = Request::new(method, uri, version);
            for (key, value) in headers {
                original.set_header(key, value);
            }
            if let Some(len) = content_length {
                original.set_header(CONTENT_LENGTH, len.to_string());
                original.content_length = Some(len);
            }

            let mut wire = BytesMut::new();
            original.encode(&mut wire);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let parsed = runtime.block_on(parse(&wire)).unwrap();

            prop_assert_eq!(
                parsed.headers.iter().collect::<Vec<_>>(),
                original.headers.iter().collect::<Vec<_>>()
            );
            prop_assert_eq!(parsed, original);
        }
    }
}
