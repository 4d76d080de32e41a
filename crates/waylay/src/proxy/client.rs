//! Upstream HTTP client construction (C6 pooling).
//!
//! `hyper_util`'s legacy `Client` already pools connections keyed by
//! authority (hostname, port, scheme), which is exactly the per-upstream
//! keying this proxy needs when each request can target a different host;
//! this module just wires it up once at startup.

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;

/// Type alias for the HTTP client used to dial upstreams (HTTP and HTTPS
/// alike; `hyper_rustls`'s connector falls back to plain TCP for `http://`
/// URIs and negotiates TLS for `https://` ones).
pub type HttpClient = Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    BoxBody<Bytes, hyper::Error>,
>;

const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const KEEPALIVE_SECS: u64 = 60;

/// Create the shared upstream client. One instance is reused across all
/// transactions; `useDirectTransport` bypasses pooling per-call by dialing a
/// fresh connection instead of routing through this client (see
/// `proxy::listener`).
pub fn create_http_client() -> HttpClient {
    let mut http_connector = hyper_util::client::legacy::connect::HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(KEEPALIVE_SECS)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(CONNECT_TIMEOUT_SECS)));
    http_connector.enforce_http(false);

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("failed to load native root certificates")
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https_connector)
}

/// Dial a fresh, unpooled connection for `hostname:port` (§4.5: the
/// normalizer sets `useDirectTransport` when a rule rewrites the upstream
/// to port 80, and direct-transport requests must bypass `create_http_client`'s
/// pool entirely rather than just skip reuse of an idle connection). The
/// connection is dropped once its single in-flight request completes.
pub async fn dial_direct(
    hostname: &str,
    port: u16,
) -> anyhow::Result<SendRequest<BoxBody<Bytes, hyper::Error>>> {
    let stream = tokio::net::TcpStream::connect((hostname, port)).await?;
    stream.set_nodelay(true).ok();
    let io = TokioIo::new(stream);
    let (sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "direct upstream connection closed");
        }
    });
    Ok(sender)
}
