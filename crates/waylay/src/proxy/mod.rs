//! Proxy server module.
//!
//! - `listener` - accept loop, connection lifecycle, CONNECT/TLS tunneling
//! - `pipeline` - rule match loop and upstream normalization
//! - `streaming` - body transducer: chunk hooks and decompression
//! - `client` - upstream HTTP client creation and pooling
//! - `tls` - per-hostname leaf certificate TLS termination
//! - `headers` - hop-by-hop stripping and content-length/encoding bookkeeping
//! - `network` - `SO_REUSEPORT` listener setup

mod client;
mod headers;
mod network;
mod pipeline;
mod streaming;
mod tls;

pub mod listener;

pub use listener::ProxyServer;
