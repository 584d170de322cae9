//! TLS ClientHello parsing and SNI extraction.
//!
//! Reads exactly one TLS record and parses it as a ClientHello. Every length
//! field is checked against the bytes that are actually there; the first
//! violation aborts with an [`Alert`] and no partial result.
//!
//! Record layout:
//! - byte 0: content type (0x16 = handshake)
//! - bytes 1-2: record version
//! - bytes 3-4: record length
//! - record length bytes: handshake message
//!
//! ClientHello handshake message:
//! - byte 0: handshake type (0x01)
//! - bytes 1-3: handshake length
//! - bytes 4-5: client version
//! - bytes 6-37: random
//! - 1 + n bytes: session ID
//! - 2 + n bytes: cipher suites
//! - 1 + n bytes: compression methods
//! - 2 + n bytes: extensions (must end exactly at the end of the record)

use std::io;

use bytes::Buf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum plaintext payload of a record.
pub const MAX_PLAINTEXT: usize = 16384;

/// Maximum ciphertext payload of a record.
pub const MAX_CIPHERTEXT: usize = 16384 + 2048;

/// Largest handshake message accepted (the protocol allows 16 MiB).
pub const MAX_HANDSHAKE: usize = 65536;

/// Smallest handshake body that can hold a ClientHello.
pub const MIN_CLIENT_HELLO: usize = 46;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const CONTENT_TYPE_SSLV2: u8 = 0x80;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const MAX_RECORD_VERSION: u16 = 0x1000;
const MAX_RECORD_LENGTH: u16 = 0x3000;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Protocol violations found while parsing a ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Alert {
    #[error("alert overflow")]
    RecordOverflow,

    #[error("alert internal error")]
    InternalError,

    #[error("alert unexpected message")]
    UnexpectedMessage,

    #[error("tls: unsupported tlsv2 message received")]
    UnsupportedTls,
}

impl Alert {
    /// Stable numeric identifier.
    pub fn code(self) -> u8 {
        match self {
            Alert::RecordOverflow => 0,
            Alert::InternalError => 1,
            Alert::UnexpectedMessage => 2,
            Alert::UnsupportedTls => 3,
        }
    }
}

/// ClientHello read failure.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Alert(#[from] Alert),

    /// The stream failed or ended before the record was complete.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TlsError {
    /// The alert, if this is a protocol violation rather than an I/O failure.
    pub fn alert(&self) -> Option<Alert> {
        match self {
            TlsError::Alert(alert) => Some(*alert),
            TlsError::Io(_) => None,
        }
    }
}

impl From<TlsError> for io::Error {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Io(e) => e,
            TlsError::Alert(alert) => io::Error::new(io::ErrorKind::InvalidData, alert),
        }
    }
}

/// A parsed ClientHello record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub content_type: u8,
    pub version: u16,
    pub length: u16,
    pub handshake_type: u8,
    pub handshake_length: u32,
    pub handshake_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Raw extension block (without its length prefix).
    pub extensions: Vec<u8>,
    /// Host name from the server_name extension; empty when absent.
    pub server_name: String,
}

impl ClientHello {
    /// The SNI host name, if the client sent one.
    pub fn server_name(&self) -> Option<&str> {
        if self.server_name.is_empty() {
            None
        } else {
            Some(&self.server_name)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    content_type: u8,
    version: u16,
    length: u16,
}

fn parse_record_header(header: &[u8; RECORD_HEADER_LEN]) -> Result<RecordHeader, Alert> {
    let content_type = header[0];
    if content_type == CONTENT_TYPE_SSLV2 {
        return Err(Alert::UnsupportedTls);
    }

    let version = u16::from_be_bytes([header[1], header[2]]);
    let length = u16::from_be_bytes([header[3], header[4]]);

    if length as usize > MAX_CIPHERTEXT {
        return Err(Alert::RecordOverflow);
    }

    if content_type != CONTENT_TYPE_HANDSHAKE
        || version >= MAX_RECORD_VERSION
        || length >= MAX_RECORD_LENGTH
    {
        return Err(Alert::UnexpectedMessage);
    }

    Ok(RecordHeader {
        content_type,
        version,
        length,
    })
}

/// Split `n` bytes off the front of `buf`. The caller checks the length.
fn take(buf: &mut &[u8], n: usize) -> Vec<u8> {
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    head.to_vec()
}

fn parse_handshake(record: RecordHeader, body: &[u8]) -> Result<ClientHello, Alert> {
    if body.len() > MAX_PLAINTEXT || body.len() < MIN_CLIENT_HELLO {
        return Err(Alert::RecordOverflow);
    }

    let mut buf = body;

    let handshake_type = buf.get_u8();
    if handshake_type != HANDSHAKE_CLIENT_HELLO {
        return Err(Alert::UnexpectedMessage);
    }

    let handshake_length = buf.get_uint(3) as usize;
    if handshake_length > MAX_HANDSHAKE {
        return Err(Alert::InternalError);
    }
    if handshake_length > buf.remaining() {
        return Err(Alert::UnexpectedMessage);
    }

    let handshake_version = buf.get_u16();

    let mut random = [0u8; 32];
    buf.copy_to_slice(&mut random);

    // At least MIN_CLIENT_HELLO - 38 bytes are left here.
    let session_id_len = buf.get_u8() as usize;
    if buf.remaining() < session_id_len {
        return Err(Alert::UnexpectedMessage);
    }
    let session_id = take(&mut buf, session_id_len);

    if buf.remaining() < 2 {
        return Err(Alert::UnexpectedMessage);
    }
    let cipher_suites_len = buf.get_u16() as usize;
    if cipher_suites_len % 2 != 0 || buf.remaining() < cipher_suites_len {
        return Err(Alert::UnexpectedMessage);
    }
    let cipher_suites = (0..cipher_suites_len / 2).map(|_| buf.get_u16()).collect();

    if !buf.has_remaining() {
        return Err(Alert::UnexpectedMessage);
    }
    let compression_len = buf.get_u8() as usize;
    if buf.remaining() < compression_len {
        return Err(Alert::UnexpectedMessage);
    }
    let compression_methods = take(&mut buf, compression_len);

    // A ClientHello may end right after the compression methods.
    let extensions = if buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(Alert::UnexpectedMessage);
        }
        let extensions_len = buf.get_u16() as usize;
        if buf.remaining() != extensions_len {
            return Err(Alert::UnexpectedMessage);
        }
        take(&mut buf, extensions_len)
    } else {
        Vec::new()
    };

    let server_name = find_server_name(&extensions)?;

    Ok(ClientHello {
        content_type: record.content_type,
        version: record.version,
        length: record.length,
        handshake_type,
        handshake_length: handshake_length as u32,
        handshake_version,
        random,
        session_id,
        cipher_suites,
        compression_methods,
        extensions,
        server_name,
    })
}

/// Walk the extension block and pull out the host name, if any.
///
/// server_name extension data:
/// - 2 bytes: server name list length
/// - 1 byte: name type (0 = host_name)
/// - 2 bytes: name length
/// - name bytes
fn find_server_name(extensions: &[u8]) -> Result<String, Alert> {
    let mut exts = extensions;
    let mut server_name = String::new();

    while exts.has_remaining() {
        if exts.remaining() < 4 {
            return Err(Alert::UnexpectedMessage);
        }
        let ext_type = exts.get_u16();
        let ext_len = exts.get_u16() as usize;
        if exts.remaining() < ext_len {
            return Err(Alert::UnexpectedMessage);
        }
        let (mut data, rest) = exts.split_at(ext_len);
        exts = rest;

        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        if data.remaining() < 2 {
            return Err(Alert::UnexpectedMessage);
        }
        let list_len = data.get_u16() as usize;
        if data.remaining() < list_len {
            return Err(Alert::UnexpectedMessage);
        }
        if !data.has_remaining() {
            continue;
        }

        if data.remaining() < 3 {
            return Err(Alert::UnexpectedMessage);
        }
        let name_type = data.get_u8();
        let name_len = data.get_u16() as usize;
        if data.remaining() < name_len {
            return Err(Alert::UnexpectedMessage);
        }

        if name_type == NAME_TYPE_HOST_NAME {
            server_name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        }
    }

    Ok(server_name)
}

/// Parse a complete record held in memory.
///
/// Bytes past the end of the record are ignored. A record cut short reports
/// `UnexpectedEof`, as reading it from a stream would.
pub fn parse_client_hello(record: &[u8]) -> Result<ClientHello, TlsError> {
    let truncated = || io::Error::new(io::ErrorKind::UnexpectedEof, "truncated tls record");

    let header: &[u8; RECORD_HEADER_LEN] = record
        .get(..RECORD_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(truncated)?;
    let header = parse_record_header(header)?;

    let body = record
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + header.length as usize)
        .ok_or_else(truncated)?;

    Ok(parse_handshake(header, body)?)
}

/// Read one TLS record from `reader` and parse it as a ClientHello.
///
/// Reads exactly the record header and the declared record length, nothing
/// more.
pub async fn read_client_hello<R>(reader: &mut R) -> Result<ClientHello, TlsError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = parse_record_header(&header)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    Ok(parse_handshake(header, &body)?)
}
