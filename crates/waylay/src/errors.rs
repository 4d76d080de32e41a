//! Error classification and page rendering (C8).
//!
//! Transport-level failures are classified into a closed set of kinds at the
//! point they originate, then rendered as either a self-contained HTML page
//! or a one-line plain-text body depending on what the client's `Accept`
//! header led us to expect.

use crate::context::TransactionContext;
use crate::url_utils::request_expects_html;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use std::convert::Infallible;
use std::fmt;

/// Closed classification of transport errors, replacing string-matching on
/// error messages with a single match point at rendering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    DnsFailure,
    ConnectionRefused,
    Timeout,
    CertError,
    Other,
}

impl ProxyErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ProxyErrorKind::DnsFailure => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::ConnectionRefused => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorKind::CertError => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ProxyErrorKind::DnsFailure => "Site Not Found",
            ProxyErrorKind::ConnectionRefused => "Connection Refused",
            ProxyErrorKind::Timeout => "Request Timeout",
            ProxyErrorKind::CertError => "Certificate Error",
            ProxyErrorKind::Other => "Proxy Error",
        }
    }

    /// Classify an I/O error that occurred while dialing or reading the upstream.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        match err.kind() {
            K::ConnectionRefused => ProxyErrorKind::ConnectionRefused,
            K::TimedOut => ProxyErrorKind::Timeout,
            K::NotFound => ProxyErrorKind::DnsFailure,
            _ => {
                let msg = err.to_string();
                if msg.contains("dns error") || msg.contains("failed to lookup address") {
                    ProxyErrorKind::DnsFailure
                } else {
                    ProxyErrorKind::Other
                }
            }
        }
    }

    /// Classify a direct (unpooled) dial failure, which surfaces as a plain
    /// `anyhow::Error` wrapping either the `io::Error` from `TcpStream::connect`
    /// or a `hyper::Error` from the handshake.
    pub fn from_connect_error(err: &anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::from_io(io_err);
        }
        let msg = err.to_string();
        if msg.contains("dns error") || msg.contains("failed to lookup address") {
            ProxyErrorKind::DnsFailure
        } else {
            ProxyErrorKind::Other
        }
    }

    pub fn from_hyper(err: &hyper_util::client::legacy::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("dns error") || msg.contains("failed to lookup address") {
            ProxyErrorKind::DnsFailure
        } else if msg.contains("tcp connect error") || msg.contains("connection refused") {
            ProxyErrorKind::ConnectionRefused
        } else if err.is_timeout() {
            ProxyErrorKind::Timeout
        } else if msg.contains("tls") || msg.contains("certificate") {
            ProxyErrorKind::CertError
        } else {
            ProxyErrorKind::Other
        }
    }
}

/// Expected transport noise: the client is already gone, never renders a
/// response and is logged at debug only.
pub fn is_common_transport_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind as K;
    if matches!(err.kind(), K::BrokenPipe | K::ConnectionReset) {
        return true;
    }
    err.to_string().contains("socket hang up")
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("failed to read CA material at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CA certificate or key: {0}")]
    Parse(String),
    #[error("failed to sign leaf certificate for {hostname}: {reason}")]
    Mint { hostname: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RuleLoadError {
    #[error("rule '{file}' does not define a match function")]
    MissingMatch { file: String },
    #[error("rule '{file}' failed to compile: {message}")]
    Compile { file: String, message: String },
}

impl fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// Render the classified error as a response, honoring the pre-write guard:
/// callers must check `!ctx.manual_response` and `!headers_sent` before
/// calling this (see `pipeline::run` and `proxy::listener`).
pub fn render_error_page(
    kind: ProxyErrorKind,
    message: &str,
    ctx: Option<&TransactionContext>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let expects_html = ctx
        .map(|c| request_expects_html(&c.client_request))
        .unwrap_or(true);

    let body = if expects_html {
        render_html(kind, message, ctx)
    } else {
        format!("{} {}: {}", kind.status().as_u16(), kind.title(), message)
    };

    Response::builder()
        .status(kind.status())
        .header(
            "content-type",
            if expects_html {
                "text/html; charset=utf-8"
            } else {
                "text/plain; charset=utf-8"
            },
        )
        .header("cache-control", "no-store")
        .header("pragma", "no-cache")
        .body(BoxBody::new(
            Full::new(Bytes::from(body)).map_err(|never: Infallible| match never {}),
        ))
        .expect("static header values are always valid")
}

fn render_html(kind: ProxyErrorKind, message: &str, ctx: Option<&TransactionContext>) -> String {
    let url = ctx
        .and_then(|c| c.parsed_url.as_deref())
        .unwrap_or("(unknown)");
    let timestamp = chrono::Utc::now().to_rfc3339();
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{status} {title}</title></head>
<body>
<h1>{status} {title}</h1>
<p>{message}</p>
<p><strong>URL:</strong> {url}</p>
<p><small>{timestamp}</small></p>
</body>
</html>"#,
        status = kind.status().as_u16(),
        title = kind.title(),
        message = html_escape(message),
        url = html_escape(url),
        timestamp = timestamp,
    )
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_refused() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(ProxyErrorKind::from_io(&err), ProxyErrorKind::ConnectionRefused);
        assert_eq!(ProxyErrorKind::ConnectionRefused.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn classifies_timeout() {
        let err = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(ProxyErrorKind::from_io(&err), ProxyErrorKind::Timeout);
        assert_eq!(ProxyErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn other_defaults_to_500() {
        assert_eq!(ProxyErrorKind::Other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn suppresses_broken_pipe() {
        let err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(is_common_transport_error(&err));
    }

    #[test]
    fn does_not_suppress_other_errors() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(!is_common_transport_error(&err));
    }

    #[test]
    fn plain_text_rendering_for_non_html() {
        let response = render_error_page(ProxyErrorKind::DnsFailure, "no such host", None);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "no-store"
        );
    }
}
