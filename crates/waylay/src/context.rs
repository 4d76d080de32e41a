//! Per-transaction context (C3).
//!
//! One `TransactionContext` is created per client transaction, passed by
//! reference through the pipeline, and dropped when the transaction ends.
//! It is never retained past that point.

use hyper::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The upstream dial options a rule may mutate and the normalizer finalizes.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub protocol: Protocol,
    pub use_direct_transport: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl UpstreamOptions {
    /// Build the options a pass-through transaction would use before any
    /// rule has had a chance to mutate them.
    pub fn from_parsed(hostname: String, port: u16, path: String, method: Method, is_ssl: bool) -> Self {
        Self {
            hostname,
            port,
            path,
            method,
            headers: HashMap::new(),
            protocol: if is_ssl { Protocol::Https } else { Protocol::Http },
            use_direct_transport: false,
        }
    }
}

/// Minimal captured view of the inbound client request needed by the
/// pipeline and the error renderer, independent of the live hyper request
/// (which is consumed to read the body during dispatch).
#[derive(Debug, Clone)]
pub struct ClientRequestInfo {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
}

/// `clientResponse`'s writable handle: only the two flags rule scripts need
/// to observe are modeled explicitly.
#[derive(Debug, Default)]
pub struct ClientResponseState {
    headers_sent: AtomicBool,
    finished: AtomicBool,
}

impl ClientResponseState {
    pub fn headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::Acquire)
    }

    pub fn mark_headers_sent(&self) {
        self.headers_sent.store(true, Ordering::Release);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

pub struct TransactionContext {
    pub client_request: ClientRequestInfo,
    pub is_ssl: bool,
    pub parsed_url: Option<String>,
    pub upstream: UpstreamOptions,
    pub matched_rule: Option<String>,
    pub processed: bool,
    pub manual_response: bool,
    pub use_decompression: bool,
    pub client_response: Arc<ClientResponseState>,
    pub is_internal: bool,
}

impl TransactionContext {
    pub fn new(
        client_request: ClientRequestInfo,
        is_ssl: bool,
        parsed_url: Option<String>,
        upstream: UpstreamOptions,
        is_internal: bool,
    ) -> Self {
        Self {
            client_request,
            is_ssl,
            parsed_url,
            upstream,
            matched_rule: None,
            processed: false,
            manual_response: false,
            use_decompression: false,
            client_response: Arc::new(ClientResponseState::default()),
            is_internal,
        }
    }
}
