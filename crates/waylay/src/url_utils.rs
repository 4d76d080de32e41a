//! URL reconstruction and request-classification utilities (C4).

use crate::context::ClientRequestInfo;
use hyper::Uri;

/// Reconstruct an absolute URL from a proxy-form or origin-form request line:
/// use it as-is if already absolute, otherwise combine the `Host` header
/// with the origin-form path, falling back to the raw request target.
pub fn reconstruct_full_url(uri: &Uri, host_header: Option<&str>, is_ssl: bool) -> Option<String> {
    if let Some(scheme) = uri.scheme_str() {
        if scheme == "http" || scheme == "https" {
            return Some(uri.to_string());
        }
    }

    let host = host_header?;
    let scheme = if is_ssl { "https" } else { "http" };
    let raw_path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");

    let path = if raw_path.is_empty() || (raw_path.contains(':') && !raw_path.starts_with('/')) {
        "/".to_string()
    } else if !raw_path.starts_with('/') {
        format!("/{raw_path}")
    } else {
        raw_path.to_string()
    };

    Some(format!("{scheme}://{host}{path}"))
}

/// True when `host` matches any configured internal-request substring.
pub fn is_internal_host(host: &str, internal_hosts: &[String]) -> bool {
    internal_hosts.iter().any(|pattern| host.contains(pattern.as_str()))
}

const NON_HTML_MEDIA_RANGES: &[&str] = &[
    "image/", "text/css", "application/json", "font/", "audio/", "video/",
];

const HTML_EXTENSIONS: &[&str] = &["html", "htm"];

const NON_HTML_EXTENSIONS: &[&str] = &[
    "js", "css", "json", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf", "mp4",
    "webm", "pdf", "zip",
];

/// Whether the error renderer (C8) should produce an HTML page or a plain
/// one-liner for this request.
pub fn request_expects_html(req: &ClientRequestInfo) -> bool {
    if let Some(accept) = req.headers.get(hyper::header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if accept.contains("text/html") {
            return true;
        }
        if NON_HTML_MEDIA_RANGES.iter().any(|range| accept.contains(range)) {
            return false;
        }
    }

    if let Some(ext) = extension_of(&req.uri) {
        if HTML_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
        if NON_HTML_EXTENSIONS.contains(&ext.as_str()) {
            return false;
        }
    }

    req.method == hyper::Method::GET
}

fn extension_of(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let last_segment = path.rsplit('/').next()?;
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;

    fn req(uri: &str, method: hyper::Method, accept: Option<&str>) -> ClientRequestInfo {
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(hyper::header::ACCEPT, accept.parse().unwrap());
        }
        ClientRequestInfo {
            method,
            uri: uri.to_string(),
            headers,
        }
    }

    #[test]
    fn reconstructs_absolute_uri_unchanged() {
        let uri: Uri = "http://example.org/p".parse().unwrap();
        let got = reconstruct_full_url(&uri, Some("ignored.example"), false);
        assert_eq!(got.as_deref(), Some("http://example.org/p"));
    }

    #[test]
    fn synthesizes_from_host_header_on_tls_tunnel() {
        let uri: Uri = "/p".parse().unwrap();
        let got = reconstruct_full_url(&uri, Some("example.org"), true);
        assert_eq!(got.as_deref(), Some("https://example.org/p"));
    }

    #[test]
    fn normalizes_colon_path_without_leading_slash() {
        let uri: Uri = "foo:bar".parse().unwrap();
        let got = reconstruct_full_url(&uri, Some("example.org"), false);
        assert_eq!(got.as_deref(), Some("http://example.org/"));
    }

    #[test]
    fn no_host_header_and_relative_uri_yields_none() {
        let uri: Uri = "/".parse().unwrap();
        let got = reconstruct_full_url(&uri, None, false);
        assert!(got.is_none());
    }

    #[test]
    fn internal_host_filter_matches_substrings() {
        let hosts = vec!["googleapis.com".to_string(), "chrome-extension".to_string()];
        assert!(is_internal_host("www.googleapis.com", &hosts));
        assert!(is_internal_host("chrome-extension://abc", &hosts));
        assert!(!is_internal_host("example.org", &hosts));
    }

    #[test]
    fn expects_html_for_html_accept() {
        let request = req("/page", hyper::Method::GET, Some("text/html,*/*"));
        assert!(request_expects_html(&request));
    }

    #[test]
    fn rejects_html_for_image_accept() {
        let request = req("/logo.png", hyper::Method::GET, Some("image/png"));
        assert!(!request_expects_html(&request));
    }

    #[test]
    fn falls_back_to_extension_when_accept_absent() {
        let request = req("/app.js", hyper::Method::GET, None);
        assert!(!request_expects_html(&request));
        let request = req("/index.html", hyper::Method::GET, None);
        assert!(request_expects_html(&request));
    }

    #[test]
    fn get_without_extension_defaults_true() {
        let request = req("/api/widgets", hyper::Method::GET, None);
        assert!(request_expects_html(&request));
    }

    #[test]
    fn non_get_without_extension_defaults_false() {
        let request = req("/api/widgets", hyper::Method::POST, None);
        assert!(!request_expects_html(&request));
    }
}
