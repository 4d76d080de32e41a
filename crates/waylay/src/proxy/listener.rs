//! HTTP/HTTPS Listener and Transaction Lifecycle (C6).
//!
//! One `tokio::spawn`'d task per accepted connection; within a connection,
//! requests are served sequentially by `hyper::server::conn::http1`, the
//! same single-connection-per-task shape as this codebase's existing
//! `ProxyServer::run`. A `CONNECT` request upgrades the raw TCP stream,
//! terminates TLS with a per-hostname leaf from `cert::CertStore`, and then
//! re-enters the same HTTP/1.1 serving loop over the decrypted stream —
//! this is the one lifecycle state machine `ReadHead -> Matched|Passthrough
//! |ManualOwned -> Dial -> Streaming -> Done` that this module implements,
//! whether or not the connection happened to go through a CONNECT tunnel.

use crate::cert::CertStore;
use crate::config::Config;
use crate::context::{ClientRequestInfo, TransactionContext, UpstreamOptions};
use crate::errors::{is_common_transport_error, render_error_page, ProxyErrorKind};
use crate::proxy::client::{create_http_client, dial_direct, HttpClient};
use crate::proxy::headers::{clear_length_and_encoding_for_rewritten_body, strip_hop_by_hop};
use crate::proxy::network::create_reusable_listener;
use crate::proxy::pipeline::{self, PostCondition};
use crate::proxy::streaming::{detect_content_encoding, BodyAccumulator};
use crate::proxy::tls::acceptor_for_host;
use crate::rules::engine::{create_engine, ManualResponse};
use crate::rules::RuleStore;
use crate::stats::StatsSink;
use crate::url_utils::{is_internal_host, reconstruct_full_url};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rhai::Engine;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

type RespBody = BoxBody<Bytes, hyper::Error>;

pub struct ProxyServer {
    settings: Config,
    cert_store: Arc<CertStore>,
    rule_store: Arc<RuleStore>,
    stats: Arc<StatsSink>,
    engine: Engine,
    http_client: HttpClient,
    active_connections: AtomicUsize,
    drained: Notify,
}

impl ProxyServer {
    pub fn new(
        settings: Config,
        cert_store: Arc<CertStore>,
        rule_store: Arc<RuleStore>,
        stats: Arc<StatsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            cert_store,
            rule_store,
            stats,
            engine: create_engine(),
            http_client: create_http_client(),
            active_connections: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Accept loop. Runs until `shutdown` reports `true`, then stops
    /// accepting and waits (bounded by `shutdownGraceSeconds`) for
    /// in-flight connections to finish before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = self.settings.bind_addr();
        let listener = create_reusable_listener(bind_addr)?;
        self.stats.record_system(format!("waylay listening on {bind_addr}"));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stats.record_system("shutdown requested, draining in-flight connections");
        let grace = Duration::from_secs(self.settings.proxy.shutdown_grace_seconds.max(1));
        if tokio::time::timeout(grace, self.wait_drained()).await.is_err() {
            self.stats.record_system("shutdown grace period elapsed with connections still open");
        }
        self.stats.log_snapshot();
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let server = self.clone();
        server.active_connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = server.clone().handle_connection(stream, peer).await {
                tracing::debug!(%peer, error = %e, "connection ended");
            }
            if server.active_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
                server.drained.notify_waiters();
            }
        });
    }

    async fn wait_drained(&self) {
        while self.active_connections.load(Ordering::SeqCst) > 0 {
            self.drained.notified().await;
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.dispatch(req, peer, false).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await?;
        Ok(())
    }

    /// Entry point for every request on a connection, plain or TLS-terminated.
    async fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        is_ssl: bool,
    ) -> Result<Response<RespBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req, peer));
        }
        Ok(self.handle_request(req, is_ssl).await)
    }

    /// `CONNECT host:port`: acknowledge the tunnel, then take over the
    /// upgraded raw stream to terminate TLS and recurse into HTTP/1.1
    /// serving over the decrypted bytes (the HTTPS leg of C6's lifecycle).
    fn handle_connect(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<RespBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return plain_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };
        let hostname = authority.host().to_string();

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = self.serve_tls_tunnel(upgraded, hostname, peer).await {
                        if !is_benign_anyhow(&e) {
                            tracing::warn!(%peer, error = %e, "TLS tunnel ended with error");
                        }
                    }
                }
                Err(e) => tracing::warn!(%peer, error = %e, "CONNECT upgrade failed"),
            }
        });

        // The exact reason phrase ("Connection established") is not modeled
        // by `http::Response`; clients key off the status code, not the text.
        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("static response is always valid")
    }

    async fn serve_tls_tunnel(
        self: Arc<Self>,
        upgraded: Upgraded,
        hostname: String,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let acceptor = acceptor_for_host(&self.cert_store, &hostname).await?;
        let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;
        let io = TokioIo::new(tls_stream);

        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.dispatch(req, peer, true).await }
        });

        http1::Builder::new().serve_connection(io, service).await?;
        Ok(())
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>, is_ssl: bool) -> Response<RespBody> {
        let (parts, body) = req.into_parts();

        let host_header = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let host_only = host_header.as_deref().map(|h| h.split(':').next().unwrap_or(h).to_string());
        let is_internal = host_only
            .as_deref()
            .map(|h| is_internal_host(h, &self.settings.internal_hosts))
            .unwrap_or(false);
        self.stats.record_request(host_only.as_deref().unwrap_or("(no host)"), is_internal);

        let parsed_url = reconstruct_full_url(&parts.uri, host_header.as_deref(), is_ssl);
        self.stats.record_request_event(
            parts.method.as_str(),
            parsed_url.as_deref().unwrap_or(&parts.uri.to_string()),
        );

        let (hostname, port) = match &host_header {
            Some(h) => split_host_port(h, is_ssl),
            None => (String::new(), if is_ssl { 443 } else { 80 }),
        };
        let upstream = UpstreamOptions::from_parsed(
            hostname,
            port,
            parts.uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_default(),
            parts.method.clone(),
            is_ssl,
        );

        let client_request = ClientRequestInfo {
            method: parts.method.clone(),
            uri: parts.uri.to_string(),
            headers: parts.headers.clone(),
        };
        let ctx = TransactionContext::new(client_request, is_ssl, parsed_url, upstream, is_internal);

        let snapshot = self.rule_store.enabled_rules();
        match pipeline::run(ctx, &snapshot, &self.engine, &self.rule_store, &self.stats) {
            Ok(PostCondition::NoRoute(ctx)) => {
                self.stats.record_rule_issue("request has neither an absolute URI nor a Host header; no route");
                render_error_page(ProxyErrorKind::Other, "could not determine request target", Some(&ctx))
                    .map(to_resp_body)
            }
            Ok(PostCondition::Manual(ctx, response)) => manual_response(&ctx, response),
            Ok(PostCondition::Upstream(ctx)) | Ok(PostCondition::PassThrough(ctx)) => {
                self.forward(ctx, body).await
            }
            Err(err) => {
                self.stats
                    .record_error(format!("rule '{}' on_request() threw: {}", err.rule, err.message));
                render_error_page(ProxyErrorKind::Other, &err.message, Some(&err.ctx)).map(to_resp_body)
            }
        }
    }

    /// Dial the upstream named by `ctx.upstream`, forward the request body
    /// (optionally through a rule's `on_request_data` hook), and stream the
    /// response back (optionally through `on_response_data`, decompression,
    /// and `on_response_end`). The `Dial -> Streaming -> Done` legs of C6's
    /// lifecycle.
    ///
    /// Bodies are fully buffered rather than forwarded frame-by-frame: the
    /// chunk hooks are synchronous Rhai calls keyed to whatever the kernel
    /// handed back from one `read()`, which is not a meaningful content
    /// boundary, so there is nothing lost by collecting first and calling
    /// the hook once over the whole body. This trades peak memory for a
    /// dramatically simpler and more correct implementation; very large
    /// bodies are a known limitation, not a silent behavior change (rules
    /// that never set `use_decompression` and have no data hooks still pay
    /// only one extra copy, not a second round trip).
    async fn forward(self: Arc<Self>, ctx: TransactionContext, body: Incoming) -> Response<RespBody> {
        let rule = self.matched_rule(&ctx);

        let request_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(&ctx)).map(to_resp_body);
            }
        };
        let request_bytes = match self.run_chunk_hook(&rule, "on_request_data", &ctx, &request_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.record_error(format!("on_request_data failed: {e}"));
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(&ctx)).map(to_resp_body);
            }
        };

        let upstream_uri = match build_upstream_uri(&ctx) {
            Ok(uri) => uri,
            Err(e) => {
                self.stats.record_rule_issue(format!("invalid upstream target: {e}"));
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(&ctx)).map(to_resp_body);
            }
        };

        let mut builder = Request::builder().method(ctx.upstream.method.clone()).uri(upstream_uri);
        let override_names: std::collections::HashSet<String> = ctx
            .upstream
            .headers
            .keys()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        for (name, value) in ctx.client_request.headers.iter() {
            if !override_names.contains(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &ctx.upstream.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let outgoing_body = BoxBody::new(Full::new(request_bytes).map_err(|never: Infallible| match never {}));
        let mut upstream_req = match builder.body(outgoing_body) {
            Ok(req) => req,
            Err(e) => {
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(&ctx)).map(to_resp_body);
            }
        };
        strip_hop_by_hop(upstream_req.headers_mut());

        let upstream_response = if ctx.upstream.use_direct_transport {
            match self.dial_direct_request(&ctx, upstream_req).await {
                Ok(resp) => resp,
                Err((kind, message)) => {
                    self.stats.record_error(format!("upstream dial failed: {message}"));
                    return render_error_page(kind, &message, Some(&ctx)).map(to_resp_body);
                }
            }
        } else {
            match self.http_client.request(upstream_req).await {
                Ok(resp) => resp,
                Err(e) => {
                    let kind = ProxyErrorKind::from_hyper(&e);
                    self.stats.record_error(format!("upstream dial failed: {e}"));
                    return render_error_page(kind, &e.to_string(), Some(&ctx)).map(to_resp_body);
                }
            }
        };

        self.stats.record_response_event(
            upstream_response.status().as_u16(),
            ctx.parsed_url.as_deref().unwrap_or(""),
        );

        self.build_client_response(&ctx, rule.as_ref(), upstream_response).await
    }

    /// Dial `ctx.upstream` directly, bypassing `self.http_client`'s pool
    /// entirely (§4.5: `useDirectTransport` means a fresh connection per
    /// request, not merely "don't reuse an idle one").
    async fn dial_direct_request(
        &self,
        ctx: &TransactionContext,
        upstream_req: Request<RespBody>,
    ) -> Result<Response<Incoming>, (ProxyErrorKind, String)> {
        let mut sender = dial_direct(&ctx.upstream.hostname, ctx.upstream.port)
            .await
            .map_err(|e| (ProxyErrorKind::from_connect_error(&e), e.to_string()))?;
        sender
            .send_request(upstream_req)
            .await
            .map_err(|e| (ProxyErrorKind::Other, e.to_string()))
    }

    /// Snapshot-local lookup of the rule that matched this transaction, by
    /// filename. Held as an `Arc` (not a borrow) so it can cross `.await`
    /// points freely.
    fn matched_rule(&self, ctx: &TransactionContext) -> Option<Arc<crate::rules::SnapshotEntry>> {
        let filename = ctx.matched_rule.as_ref()?;
        self.rule_store
            .enabled_rules()
            .iter()
            .find(|e| &e.rule.filename == filename)
            .cloned()
    }

    fn run_chunk_hook(
        &self,
        rule: &Option<Arc<crate::rules::SnapshotEntry>>,
        hook: &str,
        ctx: &TransactionContext,
        chunk: &Bytes,
    ) -> anyhow::Result<Bytes> {
        let Some(entry) = rule else {
            return Ok(chunk.clone());
        };
        let has_hook = match hook {
            "on_request_data" => entry.rule.has_on_request_data(),
            "on_response_data" => entry.rule.has_on_response_data(),
            _ => false,
        };
        if !has_hook {
            return Ok(chunk.clone());
        }
        match entry.rule.call_chunk_hook(&self.engine, hook, ctx, chunk)? {
            Some(rewritten) => Ok(Bytes::from(rewritten)),
            None => Ok(chunk.clone()),
        }
    }

    async fn build_client_response(
        &self,
        ctx: &TransactionContext,
        rule: Option<&Arc<crate::rules::SnapshotEntry>>,
        upstream_response: Response<hyper::body::Incoming>,
    ) -> Response<RespBody> {
        let (mut parts, body) = upstream_response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let raw_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(ctx)).map(to_resp_body);
            }
        };

        let encoding = detect_content_encoding(&parts.headers);
        let needs_decompress = ctx.use_decompression && encoding != crate::proxy::streaming::ContentEncoding::Identity;

        let is_inflatable = matches!(
            encoding,
            crate::proxy::streaming::ContentEncoding::Gzip | crate::proxy::streaming::ContentEncoding::Deflate
        );
        let mut payload = if needs_decompress {
            let mut accumulator = BodyAccumulator::new(encoding);
            accumulator.push(&raw_bytes);
            match accumulator.finish() {
                Ok(bytes) => {
                    if is_inflatable {
                        clear_length_and_encoding_for_rewritten_body(&mut parts.headers);
                    }
                    bytes
                }
                Err(e) => {
                    return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(ctx)).map(to_resp_body);
                }
            }
        } else {
            raw_bytes.to_vec()
        };

        let pre_rewrite_len = payload.len();
        match self.run_chunk_hook(&rule.cloned(), "on_response_data", ctx, &Bytes::from(payload.clone())) {
            Ok(rewritten) => {
                payload = rewritten.to_vec();
                if payload.len() != pre_rewrite_len {
                    clear_length_and_encoding_for_rewritten_body(&mut parts.headers);
                }
            }
            Err(e) => {
                self.stats.record_error(format!("on_response_data failed: {e}"));
                return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(ctx)).map(to_resp_body);
            }
        }

        if let Some(entry) = rule {
            if entry.rule.has_on_response_end() {
                match entry.rule.call_on_response_end(&self.engine, ctx, &payload) {
                    Ok(Some(replacement)) => {
                        payload = replacement;
                        clear_length_and_encoding_for_rewritten_body(&mut parts.headers);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.stats.record_error(format!("on_response_end failed: {e}"));
                        return render_error_page(ProxyErrorKind::Other, &e.to_string(), Some(ctx)).map(to_resp_body);
                    }
                }
            }
        }

        ctx.client_response.mark_headers_sent();
        let response_body = BoxBody::new(Full::new(Bytes::from(payload)).map_err(|never: Infallible| match never {}));
        ctx.client_response.mark_finished();
        Response::from_parts(parts, response_body)
    }
}

fn manual_response(ctx: &TransactionContext, response: ManualResponse) -> Response<RespBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK));
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = BoxBody::new(Full::new(Bytes::from(response.body)).map_err(|never: Infallible| match never {}));
    let built = builder.body(body).unwrap_or_else(|_| {
        render_error_page(ProxyErrorKind::Other, "malformed manual response", Some(ctx)).map(to_resp_body)
    });
    ctx.client_response.mark_headers_sent();
    ctx.client_response.mark_finished();
    built
}

fn build_upstream_uri(ctx: &TransactionContext) -> anyhow::Result<hyper::Uri> {
    let scheme = match ctx.upstream.protocol {
        crate::context::Protocol::Http => "http",
        crate::context::Protocol::Https => "https",
    };
    let path = if ctx.upstream.path.starts_with('/') {
        ctx.upstream.path.clone()
    } else {
        format!("/{}", ctx.upstream.path)
    };
    let authority = if matches!(ctx.upstream.port, 80 | 443) {
        ctx.upstream.hostname.clone()
    } else {
        format!("{}:{}", ctx.upstream.hostname, ctx.upstream.port)
    };
    format!("{scheme}://{authority}{path}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid upstream URI: {e}"))
}

fn split_host_port(host_header: &str, is_ssl: bool) -> (String, u16) {
    match host_header.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(if is_ssl { 443 } else { 80 }))
        }
        _ => (host_header.to_string(), if is_ssl { 443 } else { 80 }),
    }
}

fn empty_body() -> RespBody {
    BoxBody::new(http_body_util::Empty::new().map_err(|never: Infallible| match never {}))
}

fn plain_response(status: StatusCode, message: &str) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(BoxBody::new(
            Full::new(Bytes::from(message.to_string())).map_err(|never: Infallible| match never {}),
        ))
        .expect("static response is always valid")
}

fn to_resp_body(body: BoxBody<Bytes, Infallible>) -> RespBody {
    body.map_err(|never: Infallible| match never {}).boxed()
}

fn is_benign_anyhow(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>().map(is_common_transport_error).unwrap_or(false)
}
