//! Streaming Body Transducer (C7): per-chunk rule hooks and transparent
//! gzip/deflate decompression.
//!
//! Each chunk passes through a rule's `on_request_data`/`on_response_data`
//! hook before it reaches the wire. Decompression uses `flate2`, pointed at
//! a buffered full body rather than at a single upstream response.

use hyper::HeaderMap;
use std::io::Read;

/// The subset of `Content-Encoding` values this proxy knows how to
/// transparently decompress. Anything else passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Unsupported(String),
}

pub fn detect_content_encoding(headers: &HeaderMap) -> ContentEncoding {
    let Some(value) = headers.get("content-encoding").and_then(|v| v.to_str().ok()) else {
        return ContentEncoding::Identity;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "identity" => ContentEncoding::Identity,
        "gzip" | "x-gzip" => ContentEncoding::Gzip,
        "deflate" => ContentEncoding::Deflate,
        other => ContentEncoding::Unsupported(other.to_string()),
    }
}

/// Full-buffer accumulator used when `ctx.use_decompression` is set (or a
/// rule declares `on_response_end`, which by construction needs the whole
/// body in one piece). Forwarding is deferred until `finish()` runs,
/// trading streaming latency for the ability to inspect/rewrite a complete
/// payload.
pub struct BodyAccumulator {
    buffer: Vec<u8>,
    encoding: ContentEncoding,
}

impl BodyAccumulator {
    pub fn new(encoding: ContentEncoding) -> Self {
        Self {
            buffer: Vec::new(),
            encoding,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decompress (if the encoding is one we support) the accumulated
    /// bytes. Unsupported encodings (brotli, zstd) are returned unmodified
    /// with a warning logged once here; C7 only promises gzip/deflate.
    pub fn finish(self) -> anyhow::Result<Vec<u8>> {
        match self.encoding {
            ContentEncoding::Identity => Ok(self.buffer),
            ContentEncoding::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(&self.buffer[..]);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| anyhow::anyhow!("gzip decompression failed: {e}"))?;
                Ok(out)
            }
            ContentEncoding::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(&self.buffer[..]);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| anyhow::anyhow!("deflate decompression failed: {e}"))?;
                Ok(out)
            }
            ContentEncoding::Unsupported(ref encoding) => {
                tracing::warn!(%encoding, "unsupported content-encoding, forwarding without decompression");
                Ok(self.buffer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn headers_with_encoding(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", value.parse().unwrap());
        headers
    }

    #[test]
    fn detects_gzip_and_deflate_case_insensitively() {
        assert_eq!(detect_content_encoding(&headers_with_encoding("GZIP")), ContentEncoding::Gzip);
        assert_eq!(detect_content_encoding(&headers_with_encoding("deflate")), ContentEncoding::Deflate);
        assert_eq!(detect_content_encoding(&HeaderMap::new()), ContentEncoding::Identity);
    }

    #[test]
    fn unsupported_encoding_is_tagged_not_rejected() {
        match detect_content_encoding(&headers_with_encoding("br")) {
            ContentEncoding::Unsupported(v) => assert_eq!(v, "br"),
            _ => panic!("expected Unsupported"),
        }
    }

    #[test]
    fn accumulator_round_trips_gzip() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut acc = BodyAccumulator::new(ContentEncoding::Gzip);
        acc.push(&compressed[..5]);
        acc.push(&compressed[5..]);
        assert_eq!(acc.finish().unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn accumulator_passes_through_unsupported_encoding() {
        let mut acc = BodyAccumulator::new(ContentEncoding::Unsupported("zstd".to_string()));
        acc.push(b"raw bytes");
        assert_eq!(acc.finish().unwrap(), b"raw bytes".to_vec());
    }

    #[test]
    fn identity_encoding_is_passthrough() {
        let mut acc = BodyAccumulator::new(ContentEncoding::Identity);
        acc.push(b"no encoding here");
        assert_eq!(acc.finish().unwrap(), b"no encoding here".to_vec());
    }
}
