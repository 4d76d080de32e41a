//! TLS server-side termination for intercepted CONNECT tunnels (C1 + C6).
//!
//! Generalizes this codebase's previous static single-cert `TlsAcceptor`
//! construction into a per-hostname one: the listener already knows the
//! target hostname from the `CONNECT host:port` line, so the leaf is minted
//! (or fetched from cache) before the TLS config is built rather than via a
//! synchronous SNI callback.

use crate::cert::CertStore;
use crate::errors::CertError;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a `TlsAcceptor` presenting the leaf certificate for `hostname`,
/// minting it through `store` on first use (see `CertStore::get_leaf`).
pub async fn acceptor_for_host(store: &CertStore, hostname: &str) -> Result<TlsAcceptor, CertError> {
    let leaf = store.get_leaf(hostname).await?;

    let key = rustls::crypto::ring::sign::any_supported_type(&leaf.key_der)
        .map_err(|e| CertError::Mint {
            hostname: hostname.to_string(),
            reason: format!("unsupported leaf key type: {e}"),
        })?;

    let certified_key = rustls::sign::CertifiedKey::new(vec![leaf.cert_der.clone()], key);
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StaticResolver(Arc::new(certified_key))));

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A `ResolvesServerCert` that always hands back the one leaf this
/// connection was built for, regardless of the client's SNI value (a client
/// CONNECTing to `host:port` and then presenting a different SNI is not a
/// case this proxy needs to serve correctly).
struct StaticResolver(Arc<rustls::sign::CertifiedKey>);

impl rustls::server::ResolvesServerCert for StaticResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.0.clone())
    }
}
