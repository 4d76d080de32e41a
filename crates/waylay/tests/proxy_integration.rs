//! End-to-end tests that drive a real `ProxyServer` over loopback sockets:
//! a tiny upstream, a raw-socket "client", and assertions on what actually
//! crosses the wire. Exercises the plain HTTP pass-through path, the
//! manual-response short circuit, and hot rule toggling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use waylay::cert::CertStore;
use waylay::config::Config;
use waylay::proxy::ProxyServer;
use waylay::rules::{RuleStateStore, RuleStore};
use waylay::stats::StatsSink;

/// A minimal upstream server that always answers with `body`, closing the
/// connection after each response (matching the `Connection: close` our
/// raw-socket client sends through the proxy).
async fn spawn_upstream(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                    let response = Response::builder()
                        .status(200)
                        .header("content-type", "text/plain")
                        .body(Full::new(Bytes::from(body)))
                        .expect("valid response");
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
    addr
}

/// Start a `ProxyServer` bound to a free loopback port, rooted at
/// `rules_dir`/`cert_dir`, and wait until it is actually accepting
/// connections before returning.
async fn spawn_proxy(rules_dir: &Path, cert_dir: &Path) -> (SocketAddr, Arc<RuleStore>) {
    let port = port_check::free_local_ipv4_port().expect("a free local port for the proxy");

    let mut config = Config::default();
    config.proxy.host = std::net::IpAddr::from([127, 0, 0, 1]);
    config.proxy.port = port;
    config.proxy.ca_cert_dir = cert_dir.to_path_buf();
    config.rules_dir = rules_dir.to_path_buf();

    let cert_store = Arc::new(CertStore::bootstrap(&config.proxy.ca_cert_dir).expect("bootstrap CA"));
    let state = Arc::new(RuleStateStore::load(&rules_dir.join("rules-state.json")));
    let rule_store = RuleStore::open(rules_dir, state).expect("open rule store");
    let stats = StatsSink::new(config.proxy.log_level);

    let server = ProxyServer::new(config, cert_store, rule_store.clone(), stats);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    wait_until_reachable(addr).await;
    (addr, rule_store)
}

async fn wait_until_reachable(addr: SocketAddr) {
    for _ in 0..200 {
        if port_check::is_port_reachable(addr) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("proxy never became reachable at {addr}");
}

/// Send a raw proxy-form request (`GET http://host/path HTTP/1.1`) over a
/// fresh connection and read the full response until the server closes it.
async fn send_proxy_request(proxy_addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    stream.write_all(request.as_bytes()).await.expect("write request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn plain_http_request_is_forwarded_to_upstream_unchanged() {
    let upstream_addr = spawn_upstream("hello from upstream").await;
    let rules_dir = tempfile::tempdir().expect("rules tempdir");
    let cert_dir = tempfile::tempdir().expect("cert tempdir");
    let (proxy_addr, _rules) = spawn_proxy(rules_dir.path(), cert_dir.path()).await;

    let request =
        format!("GET http://{upstream_addr}/hello HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n");
    let response = send_proxy_request(proxy_addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected status line: {response}");
    assert!(response.contains("hello from upstream"));
}

#[tokio::test]
async fn manual_response_rule_short_circuits_before_dialing_upstream() {
    let upstream_addr = spawn_upstream("upstream should never see this request").await;
    let rules_dir = tempfile::tempdir().expect("rules tempdir");
    let cert_dir = tempfile::tempdir().expect("cert tempdir");
    std::fs::write(
        rules_dir.path().join("010-block.rhai"),
        r#"
fn match(url, request, ctx) { url.contains("/blocked") }
fn on_request(ctx) {
    #{ manualResponse: true, status: 403, body: "blocked by rule" }
}
"#,
    )
    .expect("write rule file");

    let (proxy_addr, _rules) = spawn_proxy(rules_dir.path(), cert_dir.path()).await;

    let request =
        format!("GET http://{upstream_addr}/blocked HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n");
    let response = send_proxy_request(proxy_addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 403"), "unexpected status line: {response}");
    assert!(response.contains("blocked by rule"));
}

#[tokio::test]
async fn toggling_a_rule_off_affects_only_subsequent_requests() {
    let upstream_addr = spawn_upstream("plain upstream body").await;
    let rules_dir = tempfile::tempdir().expect("rules tempdir");
    let cert_dir = tempfile::tempdir().expect("cert tempdir");
    std::fs::write(
        rules_dir.path().join("010-intercept.rhai"),
        r#"
fn match(url, request, ctx) { url.contains("/toggle-me") }
fn on_request(ctx) {
    #{ manualResponse: true, status: 418, body: "rule still active" }
}
"#,
    )
    .expect("write rule file");

    let (proxy_addr, rule_store) = spawn_proxy(rules_dir.path(), cert_dir.path()).await;

    let request =
        format!("GET http://{upstream_addr}/toggle-me HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n");

    let before = send_proxy_request(proxy_addr, &request).await;
    assert!(before.starts_with("HTTP/1.1 418"), "rule should still be active: {before}");

    let now_enabled = rule_store.toggle("010-intercept.rhai");
    assert!(!now_enabled, "toggle should have disabled the rule");

    let after = send_proxy_request(proxy_addr, &request).await;
    assert!(after.starts_with("HTTP/1.1 200"), "disabled rule should fall through to upstream: {after}");
    assert!(after.contains("plain upstream body"));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn startup_logs_that_the_proxy_is_listening() {
    let rules_dir = tempfile::tempdir().expect("rules tempdir");
    let cert_dir = tempfile::tempdir().expect("cert tempdir");
    let (_proxy_addr, _rules) = spawn_proxy(rules_dir.path(), cert_dir.path()).await;

    assert!(logs_contain("listening"));
}
