//! Stats & Log Sink (C9) plus the ambient structured event stream (A3).
//!
//! Counters follow this codebase's existing lock-free-read, atomic-increment
//! discipline for hot-path state. The structured event stream is a
//! `tokio::sync::broadcast` channel an external UI can subscribe to; when
//! nobody is subscribed the sink still prints through `tracing`, so ordinary
//! log capture sees the same information.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Request,
    Response,
    Error,
    Rule,
    System,
    Stats,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub rules_matched: u64,
    pub pass_through: u64,
    pub https_to_http: u64,
    pub http_to_https: u64,
    pub unique_hosts: usize,
    pub rules_used: usize,
    pub start_time: DateTime<Utc>,
}

struct Counters {
    total_requests: AtomicU64,
    rules_matched: AtomicU64,
    pass_through: AtomicU64,
    https_to_http: AtomicU64,
    http_to_https: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            rules_matched: AtomicU64::new(0),
            pass_through: AtomicU64::new(0),
            https_to_http: AtomicU64::new(0),
            http_to_https: AtomicU64::new(0),
        }
    }
}

/// Log-level gate for the plain stderr/stdout fallback: 0=errors, 1=basic,
/// 2=debug, matching `proxy.logLevel`.
pub struct StatsSink {
    counters: Counters,
    unique_hosts: Mutex<HashSet<String>>,
    rules_used: Mutex<HashSet<String>>,
    start_time: DateTime<Utc>,
    events: broadcast::Sender<Event>,
    log_level: u8,
}

impl StatsSink {
    pub fn new(log_level: u8) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            counters: Counters::default(),
            unique_hosts: Mutex::new(HashSet::new()),
            rules_used: Mutex::new(HashSet::new()),
            start_time: Utc::now(),
            events,
            log_level,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Record a request. `internal` requests (the internal-host filter)
    /// never touch any counter or set.
    pub fn record_request(&self, host: &str, internal: bool) {
        if internal {
            return;
        }
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        self.unique_hosts.lock().insert(host.to_string());
    }

    pub fn record_rule_matched(&self, rule_name: &str, internal: bool) {
        if internal {
            return;
        }
        self.counters.rules_matched.fetch_add(1, Ordering::Relaxed);
        self.rules_used.lock().insert(rule_name.to_string());
        self.emit(EventType::Rule, format!("rule matched: {rule_name}"), serde_json::json!({ "rule": rule_name }));
    }

    pub fn record_pass_through(&self, internal: bool) {
        if internal {
            return;
        }
        self.counters.pass_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_https_to_http(&self) {
        self.counters.https_to_http.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_to_https(&self) {
        self.counters.http_to_https.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.emit(EventType::Error, message, serde_json::Value::Null);
    }

    /// Rule-configuration problems found during post-rule validation:
    /// logged as an error but never fatal to the transaction.
    pub fn record_rule_issue(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.emit(EventType::Rule, message, serde_json::Value::Null);
    }

    pub fn record_system(&self, message: impl Into<String>) {
        let message = message.into();
        if self.log_level >= 1 {
            tracing::info!("{message}");
        }
        self.emit(EventType::System, message, serde_json::Value::Null);
    }

    pub fn record_request_event(&self, method: &str, url: &str) {
        if self.log_level >= 2 {
            tracing::debug!(method, url, "request");
        }
        self.emit(
            EventType::Request,
            format!("{method} {url}"),
            serde_json::json!({ "method": method, "url": url }),
        );
    }

    pub fn record_response_event(&self, status: u16, url: &str) {
        if self.log_level >= 2 {
            tracing::debug!(status, url, "response");
        }
        self.emit(
            EventType::Response,
            format!("{status} {url}"),
            serde_json::json!({ "status": status, "url": url }),
        );
    }

    fn emit(&self, kind: EventType, message: String, metadata: serde_json::Value) {
        let event = Event {
            timestamp: Utc::now(),
            kind,
            message,
            metadata,
        };
        // No subscribers is the common case; broadcast::send only errors
        // when the channel has zero receivers, which is not a failure here.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            rules_matched: self.counters.rules_matched.load(Ordering::Relaxed),
            pass_through: self.counters.pass_through.load(Ordering::Relaxed),
            https_to_http: self.counters.https_to_http.load(Ordering::Relaxed),
            http_to_https: self.counters.http_to_https.load(Ordering::Relaxed),
            unique_hosts: self.unique_hosts.lock().len(),
            rules_used: self.rules_used.lock().len(),
            start_time: self.start_time,
        }
    }

    /// Render and emit the periodic (or final, on shutdown) multi-line
    /// report.
    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        let uptime = Utc::now().signed_duration_since(snap.start_time);
        let match_rate = if snap.total_requests > 0 {
            (snap.rules_matched as f64 / snap.total_requests as f64) * 100.0
        } else {
            0.0
        };

        let report = format!(
            "uptime={}s totalRequests={} uniqueHosts={} rulesMatched={} passThrough={} httpsToHttp={} httpToHttps={} activeRules={} matchRate={:.1}%",
            uptime.num_seconds(),
            snap.total_requests,
            snap.unique_hosts,
            snap.rules_matched,
            snap.pass_through,
            snap.https_to_http,
            snap.http_to_https,
            snap.rules_used,
            match_rate,
        );

        tracing::info!("{report}");
        self.emit(EventType::Stats, report, serde_json::to_value(&snap).unwrap_or_default());
    }
}

/// Spawn the periodic snapshot task. Returns the task handle so the
/// supervisor can abort it on shutdown after emitting one final snapshot.
pub fn spawn_periodic_snapshot(sink: Arc<StatsSink>, interval_minutes: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_minutes.max(1) * 60));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            sink.log_snapshot();
        }
    })
}
