//! Rule Pipeline (C5): match loop, hook invocation, and the upstream
//! normalizer that reconciles a rule's `upstream` patch into a consistent
//! `(isSSL, port, protocol, Host)` tuple.

use crate::context::{Protocol, TransactionContext};
use crate::rules::engine::{ManualResponse, OnRequestOutcome};
use crate::rules::store::Snapshot;
use crate::rules::RuleStore;
use crate::stats::StatsSink;
use rhai::Engine;

/// How the listener should proceed after the pipeline has run.
pub enum PostCondition {
    /// A rule matched (or none did) and the upstream record is normalized
    /// and ready to dial.
    Upstream(TransactionContext),
    /// A rule claimed the response; the engine must not touch the socket
    /// beyond writing exactly the response the rule described.
    Manual(TransactionContext, ManualResponse),
    /// No rule matched; dial the reconstructed URL unmodified.
    PassThrough(TransactionContext),
    /// The request URL could not be reconstructed.
    NoRoute(TransactionContext),
}

/// A matched rule's `on_request` hook threw after taking over the
/// transaction: per §7, this synthesizes a 500 rather than falling open or
/// claiming manual response (the rule never got to claim anything).
pub struct RuleRequestError {
    pub ctx: TransactionContext,
    pub rule: String,
    pub message: String,
}

/// Run the match loop against `snapshot`, invoke whichever rule wins, and
/// normalize the resulting upstream record. `snapshot` is the caller's
/// already-captured pipeline-entry view (see `RuleStore::enabled_rules`):
/// reloads that happen mid-transaction never affect it.
pub fn run(
    mut ctx: TransactionContext,
    snapshot: &Snapshot,
    engine: &Engine,
    store: &RuleStore,
    stats: &StatsSink,
) -> Result<PostCondition, RuleRequestError> {
    let Some(url) = ctx.parsed_url.clone() else {
        return Ok(PostCondition::NoRoute(ctx));
    };

    for entry in snapshot.iter().filter(|e| e.enabled) {
        let matched = match entry.rule.call_match(engine, &url, &ctx) {
            Ok(v) => v,
            Err(e) => {
                // match() is specified pure; a throwing match fails open —
                // treated as if this rule were absent, never fatal.
                stats.record_rule_issue(format!(
                    "rule '{}' match() failed, skipping: {e}",
                    entry.rule.filename
                ));
                continue;
            }
        };
        if !matched {
            continue;
        }

        ctx.processed = true;
        ctx.matched_rule = Some(entry.rule.filename.clone());
        let display_name = entry.rule.name.clone().unwrap_or_else(|| entry.rule.filename.clone());
        stats.record_rule_matched(&display_name, ctx.is_internal);
        store.record_usage(&entry.rule.filename);

        if !entry.rule.has_on_request() {
            normalize_upstream(&mut ctx, stats);
            return Ok(PostCondition::Upstream(ctx));
        }

        return match entry.rule.call_on_request(engine, &ctx) {
            Ok(OnRequestOutcome::Continue { upstream, use_decompression }) => {
                ctx.upstream = upstream;
                if let Some(flag) = use_decompression {
                    ctx.use_decompression = flag;
                }
                normalize_upstream(&mut ctx, stats);
                Ok(PostCondition::Upstream(ctx))
            }
            Ok(OnRequestOutcome::Manual(response)) => {
                ctx.manual_response = true;
                Ok(PostCondition::Manual(ctx, response))
            }
            Err(e) => Err(RuleRequestError {
                rule: entry.rule.filename.clone(),
                message: e.to_string(),
                ctx,
            }),
        };
    }

    stats.record_pass_through(ctx.is_internal);
    normalize_upstream(&mut ctx, stats);
    Ok(PostCondition::PassThrough(ctx))
}

/// Enforce consistency between `isSSL`, port, protocol, and the `Host`
/// header after a rule has had the chance to mutate the upstream record (or
/// after a pass-through, where this just fills in defaults).
fn normalize_upstream(ctx: &mut TransactionContext, stats: &StatsSink) {
    let pre_is_ssl = ctx.is_ssl;

    match ctx.upstream.port {
        80 => {
            ctx.is_ssl = false;
            ctx.upstream.protocol = Protocol::Http;
            ctx.upstream.use_direct_transport = true;
        }
        443 => {
            ctx.is_ssl = true;
            ctx.upstream.protocol = Protocol::Https;
        }
        other => {
            tracing::warn!(port = other, "upstream port is neither 80 nor 443; leaving isSSL unchanged");
        }
    }

    let host_header = if matches!(ctx.upstream.port, 80 | 443) {
        ctx.upstream.hostname.clone()
    } else {
        format!("{}:{}", ctx.upstream.hostname, ctx.upstream.port)
    };
    ctx.upstream.headers.insert("Host".to_string(), host_header);

    if ctx.upstream.path.is_empty() || ctx.upstream.path == "undefined" {
        ctx.upstream.path = "/".to_string();
    }
    if ctx.upstream.method.as_str().is_empty() {
        ctx.upstream.method = ctx.client_request.method.clone();
    }

    if ctx.upstream.hostname.is_empty() || ctx.upstream.hostname == "undefined" {
        stats.record_rule_issue(format!(
            "rule-configuration error: upstream hostname is empty or 'undefined' ({})",
            ctx.matched_rule.as_deref().unwrap_or("pass-through")
        ));
    }
    if ctx.upstream.port == 0 {
        stats.record_rule_issue(format!(
            "rule-configuration error: upstream port {} is out of range ({})",
            ctx.upstream.port,
            ctx.matched_rule.as_deref().unwrap_or("pass-through")
        ));
    }

    if ctx.is_ssl != pre_is_ssl {
        let client_host = client_host_header(ctx);
        let differs = client_host.as_deref() != Some(ctx.upstream.hostname.as_str());
        if differs {
            if ctx.is_ssl {
                stats.record_http_to_https();
            } else {
                stats.record_https_to_http();
            }
        }
    }
}

fn client_host_header(ctx: &TransactionContext) -> Option<String> {
    ctx.client_request
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}
