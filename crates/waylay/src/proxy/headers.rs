//! Hop-by-hop header handling for the listener (C6).
//!
//! RFC 7230 §6.1 hop-by-hop headers must never be forwarded verbatim between
//! client and upstream; each leg of the proxy negotiates its own framing and
//! connection semantics.

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;

/// Headers that are meaningful only for one transport hop and must be
/// stripped before forwarding in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

/// Remove hop-by-hop headers in place, including any headers named by a
/// `Connection` header's value (the mechanism RFC 7230 uses for a peer to
/// name additional per-hop headers beyond the fixed list).
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut extra: Vec<String> = Vec::new();
    for value in headers.get_all("connection").iter() {
        if let Ok(value) = value.to_str() {
            extra.extend(value.split(',').map(|s| s.trim().to_ascii_lowercase()));
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in extra {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Replace `Content-Encoding`/`Content-Length` when the engine has
/// transparently decompressed a response body, per C7's contract: once the
/// bytes reaching the client no longer match the original encoding or size,
/// both headers are misleading and chunked framing takes over.
pub fn clear_length_and_encoding_for_rewritten_body(headers: &mut HeaderMap) {
    headers.remove("content-encoding");
    headers.remove("content-length");
    headers.insert(
        "transfer-encoding",
        HeaderValue::from_static("chunked"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_from(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn strips_fixed_hop_by_hop_headers() {
        let mut headers = headers_from(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("x-custom", "yes"),
        ]);
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn strips_headers_named_in_connection_value() {
        let mut headers = headers_from(&[("connection", "x-extra-hop"), ("x-extra-hop", "drop-me"), ("x-keep", "yes")]);
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("x-extra-hop"));
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn rewritten_body_clears_encoding_and_length() {
        let mut headers = headers_from(&[("content-encoding", "gzip"), ("content-length", "42")]);
        clear_length_and_encoding_for_rewritten_body(&mut headers);
        assert!(!headers.contains_key("content-encoding"));
        assert!(!headers.contains_key("content-length"));
        assert_eq!(headers.get("transfer-encoding").unwrap(), "chunked");
    }
}
