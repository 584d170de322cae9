//! Protocol sniffing for virtual-host routing.
//!
//! This library provides the pieces a proxy needs to look at the first bytes
//! of a connection without taking them away from whoever reads it next:
//! - [`PeekBuffer`]: tee the bytes a sniffer reads and replay them afterwards
//! - [`http`]: HTTP/1.x request-head codec
//! - [`RequestRewriter`]: streaming request rewriting with untouched bodies
//! - [`tls`]: TLS ClientHello parsing and SNI extraction

pub mod http;
pub mod peek;
pub mod rewrite;
pub mod tls;

pub use http::{read_request, write_request, Headers, HttpError, Request};
pub use peek::{PeekBuffer, Tee};
pub use rewrite::{RequestRewriter, RewriteHook, RewriteState};
pub use tls::{read_client_hello, Alert, ClientHello, TlsError};
