pub mod proxy;

pub use proxy::{
    normalize_host, splice, Acceptor, AsyncStream, BackendSelector, BoxedStream, ConvertError,
    ConvertOptions, Converter, HttpHostConverter, HttpRewriteConverter, ProxyConfig, ProxyHandle,
    ProxyStats, RetryExhausted, RetryPolicy, Sniffed, StaticBackends, TlsSniConverter,
    VirtualHostProxy,
};

pub use vhost_sniff::{ClientHello, Request, RewriteHook};
