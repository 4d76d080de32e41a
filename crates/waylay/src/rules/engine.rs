//! Rule compilation and hook invocation.
//!
//! A rule is a `.rhai` script exposing `match(url, request, ctx)` and,
//! optionally, `on_request(ctx)`, `on_response(ctx)`, `on_request_data(ctx,
//! chunk)`, `on_response_data(ctx, chunk)`, `on_response_end(ctx)`. This
//! mirrors the codebase's existing Rhai-based fault-injection engine
//! (compile once, cache the `AST` behind an `Arc`, evaluate with a fresh
//! `Scope` per call) generalized from a single `should_inject_fault` entry
//! point to the multi-hook contract rules need here.

use crate::context::{Protocol, TransactionContext, UpstreamOptions};
use crate::errors::RuleLoadError;
use rhai::{Blob, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;
use std::sync::Arc;

const HOOK_MATCH: &str = "match";
const HOOK_ON_REQUEST: &str = "on_request";
const HOOK_ON_RESPONSE: &str = "on_response";
const HOOK_ON_REQUEST_DATA: &str = "on_request_data";
const HOOK_ON_RESPONSE_DATA: &str = "on_response_data";
const HOOK_ON_RESPONSE_END: &str = "on_response_end";

/// Outcome of invoking `on_request`: either the engine should proceed to
/// dial the (possibly mutated) upstream, or the rule has claimed the
/// response itself.
pub enum OnRequestOutcome {
    Continue {
        upstream: UpstreamOptions,
        use_decompression: Option<bool>,
    },
    Manual(ManualResponse),
}

/// The response a rule hands back when it claims `manualResponse`. A bare
/// `false` sentinel (no map) yields the all-defaults value here; a map with
/// `status`/`headers`/`body` keys overrides whichever of those it sets.
#[derive(Debug, Clone)]
pub struct ManualResponse {
    pub status: u16,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Default for ManualResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: std::collections::HashMap::new(),
            body: Vec::new(),
        }
    }
}

impl ManualResponse {
    fn from_map(map: &Map) -> Self {
        let mut response = Self::default();
        if let Some(status) = map.get("status").and_then(|v| v.as_int().ok()) {
            response.status = status as u16;
        }
        if let Some(headers) = map.get("headers").and_then(|v| v.clone().try_cast::<Map>()) {
            for (k, v) in headers {
                if let Some(value) = v.clone().try_cast::<String>() {
                    response.headers.insert(k.to_string(), value);
                }
            }
        }
        if let Some(body) = map.get("body").and_then(|v| v.clone().try_cast::<String>()) {
            response.body = body.into_bytes();
        } else if let Some(body) = map.get("body").and_then(|v| v.clone().try_cast::<rhai::Blob>()) {
            response.body = body;
        }
        response
    }
}

/// Rules that buffer a full body (C7's `on_response_end`) need a way to
/// turn the raw `Blob` into text, parse/rewrite it as JSON, and turn the
/// result back into bytes for the rewritten response. None of that is in
/// Rhai's standard library, so it's registered here once per engine.
pub fn create_engine() -> Engine {
    let mut engine = Engine::new();

    engine.register_fn("blob_to_string", |blob: Blob| -> Result<String, Box<EvalAltResult>> {
        String::from_utf8(blob).map_err(|e| format!("blob is not valid UTF-8: {e}").into())
    });
    engine.register_fn("string_to_blob", |s: String| -> Blob { s.into_bytes() });
    engine.register_fn("parse_json", |s: String| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: Value = serde_json::from_str(&s).map_err(|e| format!("invalid JSON: {e}"))?;
        Ok(json_to_dynamic(value))
    });
    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        serde_json::to_string(&dynamic_to_json(value)).map_err(|e| format!("failed to serialize JSON: {e}").into())
    });

    engine
}

/// A compiled rule file. Holds only what's needed to invoke its hooks;
/// enable/disable and usage-count state live in `RuleState`, not here.
pub struct CompiledRule {
    pub filename: String,
    pub name: Option<String>,
    ast: Arc<AST>,
    has_on_request: bool,
    has_on_response: bool,
    has_on_request_data: bool,
    has_on_response_data: bool,
    has_on_response_end: bool,
}

impl CompiledRule {
    pub fn compile(filename: &str, source: &str, engine: &Engine) -> Result<Self, RuleLoadError> {
        let ast = engine.compile(source).map_err(|e| RuleLoadError::Compile {
            file: filename.to_string(),
            message: e.to_string(),
        })?;

        let functions: Vec<_> = ast.iter_functions().collect();
        let has = |name: &str| functions.iter().any(|f| f.name == name);

        if !has(HOOK_MATCH) {
            return Err(RuleLoadError::MissingMatch {
                file: filename.to_string(),
            });
        }

        let name = extract_name_constant(&ast);

        Ok(Self {
            filename: filename.to_string(),
            name,
            ast: Arc::new(ast),
            has_on_request: has(HOOK_ON_REQUEST),
            has_on_response: has(HOOK_ON_RESPONSE),
            has_on_request_data: has(HOOK_ON_REQUEST_DATA),
            has_on_response_data: has(HOOK_ON_RESPONSE_DATA),
            has_on_response_end: has(HOOK_ON_RESPONSE_END),
        })
    }

    pub fn has_on_request(&self) -> bool {
        self.has_on_request
    }

    pub fn has_on_response(&self) -> bool {
        self.has_on_response
    }

    pub fn has_on_request_data(&self) -> bool {
        self.has_on_request_data
    }

    pub fn has_on_response_data(&self) -> bool {
        self.has_on_response_data
    }

    pub fn has_on_response_end(&self) -> bool {
        self.has_on_response_end
    }

    /// `match` is specified as pure; we still run it through the same
    /// engine/AST machinery as the other hooks, we just never feed its
    /// result back into the context.
    pub fn call_match(&self, engine: &Engine, url: &str, ctx: &TransactionContext) -> anyhow::Result<bool> {
        let mut scope = Scope::new();
        let request_map = request_map(ctx);
        let ctx_map = context_map(ctx);

        let result: Dynamic = engine
            .call_fn(&mut scope, &self.ast, HOOK_MATCH, (url.to_string(), request_map, ctx_map))
            .map_err(|e| anyhow::anyhow!("rule '{}' match() failed: {e}", self.filename))?;

        Ok(result.as_bool().unwrap_or(false))
    }

    /// Invoke `on_request`, snapshotting the upstream record first so a
    /// throw after a partial mutation rolls back cleanly rather than
    /// leaving the context in whatever state the script reached.
    pub fn call_on_request(
        &self,
        engine: &Engine,
        ctx: &TransactionContext,
    ) -> anyhow::Result<OnRequestOutcome> {
        let snapshot = ctx.upstream.clone();
        let mut scope = Scope::new();
        let ctx_map = context_map(ctx);

        let result = engine.call_fn::<Dynamic>(&mut scope, &self.ast, HOOK_ON_REQUEST, (ctx_map,));

        let result = match result {
            Ok(value) => value,
            Err(e) => {
                anyhow::bail!("rule '{}' on_request() threw: {e}", self.filename);
            }
        };

        if let Some(false) = result.as_bool().ok() {
            return Ok(OnRequestOutcome::Manual(ManualResponse::default()));
        }

        let Some(map) = result.clone().try_cast::<Map>() else {
            // Hook returned neither a map nor `false`: treat as "no mutation".
            return Ok(OnRequestOutcome::Continue {
                upstream: snapshot,
                use_decompression: None,
            });
        };

        if map.get("manualResponse").and_then(|v| v.as_bool().ok()).unwrap_or(false) {
            return Ok(OnRequestOutcome::Manual(ManualResponse::from_map(&map)));
        }

        let mut upstream = snapshot;
        if let Some(patch) = map.get("upstream").and_then(|v| v.clone().try_cast::<Map>()) {
            apply_upstream_patch(&mut upstream, &patch);
        }
        let use_decompression = map.get("useDecompression").and_then(|v| v.as_bool().ok());

        Ok(OnRequestOutcome::Continue {
            upstream,
            use_decompression,
        })
    }

    pub fn call_on_response(&self, engine: &Engine, ctx: &TransactionContext) -> anyhow::Result<()> {
        let mut scope = Scope::new();
        let ctx_map = context_map(ctx);
        engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, HOOK_ON_RESPONSE, (ctx_map,))
            .map_err(|e| anyhow::anyhow!("rule '{}' on_response() threw: {e}", self.filename))?;
        Ok(())
    }

    /// Transform one chunk of request or response body. `None` means "no
    /// change"; an explicit empty blob is a valid (if unusual) rewrite.
    pub fn call_chunk_hook(
        &self,
        engine: &Engine,
        hook: &str,
        ctx: &TransactionContext,
        chunk: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut scope = Scope::new();
        let ctx_map = context_map(ctx);
        let blob: rhai::Blob = chunk.to_vec();
        let result: Dynamic = engine
            .call_fn(&mut scope, &self.ast, hook, (ctx_map, blob))
            .map_err(|e| anyhow::anyhow!("rule '{}' {hook}() threw: {e}", self.filename))?;

        if result.is_unit() {
            return Ok(None);
        }
        match result.try_cast::<rhai::Blob>() {
            Some(blob) => Ok(Some(blob)),
            None => Ok(None),
        }
    }

    /// Invoke `on_response_end` with the complete (and, if C7 decompressed
    /// it, already-inflated) response body accumulated over the
    /// transaction. Unlike the per-chunk hooks this always sees the whole
    /// payload in one call, which is the point of full-buffer mode: a rule
    /// that needs to parse JSON can't do that one chunk at a time.
    pub fn call_on_response_end(
        &self,
        engine: &Engine,
        ctx: &TransactionContext,
        body: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut scope = Scope::new();
        let ctx_map = context_map(ctx);
        let blob: rhai::Blob = body.to_vec();
        let result: Dynamic = engine
            .call_fn(&mut scope, &self.ast, HOOK_ON_RESPONSE_END, (ctx_map, blob))
            .map_err(|e| anyhow::anyhow!("rule '{}' on_response_end() threw: {e}", self.filename))?;
        Ok(result.try_cast::<rhai::Blob>())
    }
}

fn apply_upstream_patch(upstream: &mut UpstreamOptions, patch: &Map) {
    if let Some(hostname) = patch.get("hostname").and_then(|v| v.clone().try_cast::<String>()) {
        upstream.hostname = hostname;
    }
    if let Some(port) = patch.get("port").and_then(|v| v.as_int().ok()) {
        upstream.port = port as u16;
    }
    if let Some(path) = patch.get("path").and_then(|v| v.clone().try_cast::<String>()) {
        upstream.path = path;
    }
    if let Some(method) = patch.get("method").and_then(|v| v.clone().try_cast::<String>()) {
        if let Ok(method) = method.parse() {
            upstream.method = method;
        }
    }
    if let Some(headers) = patch.get("headers").and_then(|v| v.clone().try_cast::<Map>()) {
        for (k, v) in headers {
            if let Some(value) = v.clone().try_cast::<String>() {
                upstream.headers.insert(k.to_string(), value);
            }
        }
    }
    if let Some(use_direct) = patch.get("useDirectTransport").and_then(|v| v.as_bool().ok()) {
        upstream.use_direct_transport = use_direct;
    }
}

fn request_map(ctx: &TransactionContext) -> Map {
    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(ctx.client_request.method.to_string()));
    map.insert("url".into(), Dynamic::from(ctx.client_request.uri.clone()));
    let mut headers = Map::new();
    for (name, value) in ctx.client_request.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().into(), Dynamic::from(value.to_string()));
        }
    }
    map.insert("headers".into(), Dynamic::from(headers));
    map
}

fn context_map(ctx: &TransactionContext) -> Map {
    let mut map = Map::new();
    map.insert("isSSL".into(), Dynamic::from(ctx.is_ssl));
    map.insert("manualResponse".into(), Dynamic::from(ctx.manual_response));

    let mut upstream = Map::new();
    upstream.insert("hostname".into(), Dynamic::from(ctx.upstream.hostname.clone()));
    upstream.insert("port".into(), Dynamic::from(ctx.upstream.port as i64));
    upstream.insert("path".into(), Dynamic::from(ctx.upstream.path.clone()));
    upstream.insert("method".into(), Dynamic::from(ctx.upstream.method.to_string()));
    upstream.insert(
        "protocol".into(),
        Dynamic::from(match ctx.upstream.protocol {
            Protocol::Http => "http".to_string(),
            Protocol::Https => "https".to_string(),
        }),
    );
    let mut headers = Map::new();
    for (k, v) in &ctx.upstream.headers {
        headers.insert(k.clone().into(), Dynamic::from(v.clone()));
    }
    upstream.insert("headers".into(), Dynamic::from(headers));
    map.insert("upstream".into(), Dynamic::from(upstream));
    map
}

/// Rule scripts may declare `const NAME = "...";` for a descriptive label;
/// read it back out of the compiled AST's constants when present.
fn extract_name_constant(ast: &AST) -> Option<String> {
    ast.iter_literal_variables(true, false)
        .find(|(name, _, _)| *name == "NAME")
        .and_then(|(_, _, value)| value.clone().try_cast::<String>())
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => n
            .as_i64()
            .map(Dynamic::from)
            .or_else(|| n.as_f64().map(Dynamic::from))
            .unwrap_or(Dynamic::UNIT),
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => Dynamic::from(arr.into_iter().map(json_to_dynamic).collect::<Vec<_>>()),
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    } else if let Some(s) = value.clone().try_cast::<String>() {
        Value::String(s)
    } else if let Some(arr) = value.clone().try_cast::<Vec<Dynamic>>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        Value::Object(obj)
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ClientRequestInfo, UpstreamOptions};
    use hyper::{HeaderMap, Method, Uri};

    fn test_ctx() -> TransactionContext {
        TransactionContext::new(
            ClientRequestInfo {
                method: Method::GET,
                uri: "https://example.org/".to_string(),
                headers: HeaderMap::new(),
            },
            true,
            Some("https://example.org/".to_string()),
            UpstreamOptions::from_parsed("example.org".to_string(), 443, "/".to_string(), Method::GET, true),
            false,
        )
    }

    #[test]
    fn compiles_rule_with_match_only() {
        let engine = create_engine();
        let script = r#"fn match(url, request, ctx) { url.contains("example.org") }"#;
        let rule = CompiledRule::compile("010-example.rhai", script, &engine).unwrap();
        assert!(!rule.has_on_request());
        let ctx = test_ctx();
        assert!(rule.call_match(&engine, "https://example.org/", &ctx).unwrap());
    }

    #[test]
    fn rejects_rule_without_match() {
        let engine = create_engine();
        let script = r#"fn on_request(ctx) { ctx }"#;
        let err = CompiledRule::compile("bad.rhai", script, &engine).unwrap_err();
        assert!(matches!(err, RuleLoadError::MissingMatch { .. }));
    }

    #[test]
    fn on_request_mutates_upstream_headers() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_request(ctx) {
                ctx.upstream.headers["X-Injected"] = "yes";
                ctx
            }
        "#;
        let rule = CompiledRule::compile("010-header.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let outcome = rule.call_on_request(&engine, &ctx).unwrap();
        match outcome {
            OnRequestOutcome::Continue { upstream, .. } => {
                assert_eq!(upstream.headers.get("X-Injected"), Some(&"yes".to_string()));
            }
            OnRequestOutcome::Manual(_) => panic!("expected Continue"),
        }
    }

    #[test]
    fn on_request_false_sentinel_claims_manual_response() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_request(ctx) { false }
        "#;
        let rule = CompiledRule::compile("manual.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let outcome = rule.call_on_request(&engine, &ctx).unwrap();
        match outcome {
            OnRequestOutcome::Manual(response) => assert_eq!(response.status, 200),
            OnRequestOutcome::Continue { .. } => panic!("expected Manual"),
        }
    }

    #[test]
    fn on_request_manual_map_carries_status_headers_and_body() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_request(ctx) {
                #{ manualResponse: true, status: 418, headers: #{ "X-Teapot": "yes" }, body: "short and stout" }
            }
        "#;
        let rule = CompiledRule::compile("teapot.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let outcome = rule.call_on_request(&engine, &ctx).unwrap();
        match outcome {
            OnRequestOutcome::Manual(response) => {
                assert_eq!(response.status, 418);
                assert_eq!(response.headers.get("X-Teapot"), Some(&"yes".to_string()));
                assert_eq!(response.body, b"short and stout".to_vec());
            }
            OnRequestOutcome::Continue { .. } => panic!("expected Manual"),
        }
    }

    #[test]
    fn on_request_throw_is_surfaced_as_error() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_request(ctx) {
                throw "boom";
            }
        "#;
        let rule = CompiledRule::compile("throws.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        assert!(rule.call_on_request(&engine, &ctx).is_err());
    }

    #[test]
    fn on_response_end_sees_full_accumulated_body() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_response_end(ctx, body) {
                body
            }
        "#;
        let rule = CompiledRule::compile("020-end.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let out = rule.call_on_response_end(&engine, &ctx, b"full body").unwrap();
        assert_eq!(out, Some(b"full body".to_vec()));
    }

    #[test]
    fn chunk_hook_rewrites_body() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_response_data(ctx, chunk) {
                chunk
            }
        "#;
        let rule = CompiledRule::compile("passthrough.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let out = rule
            .call_chunk_hook(&engine, "on_response_data", &ctx, b"hello")
            .unwrap();
        assert_eq!(out, Some(b"hello".to_vec()));
    }

    #[test]
    fn on_response_end_can_mutate_json_body() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_response_end(ctx, body) {
                let data = parse_json(blob_to_string(body));
                data.patched = true;
                string_to_blob(to_json(data))
            }
        "#;
        let rule = CompiledRule::compile("030-json.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        let out = rule
            .call_on_response_end(&engine, &ctx, br#"{"original":true}"#)
            .unwrap()
            .expect("rule returns a rewritten body");
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["original"], serde_json::json!(true));
        assert_eq!(value["patched"], serde_json::json!(true));
    }

    #[test]
    fn parse_json_rejects_malformed_input() {
        let engine = create_engine();
        let script = r#"
            fn match(url, request, ctx) { true }
            fn on_response_end(ctx, body) {
                parse_json(blob_to_string(body))
            }
        "#;
        let rule = CompiledRule::compile("040-bad-json.rhai", script, &engine).unwrap();
        let ctx = test_ctx();
        assert!(rule.call_on_response_end(&engine, &ctx, b"not json").is_err());
    }

    #[test]
    fn json_to_dynamic_and_back_round_trips_nested_values() {
        let original = serde_json::json!({
            "name": "waylay",
            "count": 3,
            "tags": ["a", "b"],
            "active": true,
            "nothing": null,
        });
        let round_tripped = dynamic_to_json(json_to_dynamic(original.clone()));
        assert_eq!(round_tripped, original);
    }
}
