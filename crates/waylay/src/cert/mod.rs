//! CA & Leaf Certificate Store (C1).
//!
//! `getLeaf(hostname)` mints a per-hostname leaf certificate on first use and
//! serves every later call from an unbounded, process-lifetime cache.
//! Concurrent first-callers for the same hostname share one mint via a
//! single-flight map, matching this codebase's existing "inflight-dedup map,
//! lock-free reads" discipline for shared read-mostly state.

mod ca;

pub use ca::{CaPaths, RootCa};

use crate::errors::CertError;
use dashmap::DashMap;
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OnceCell};

const LEAF_VALIDITY_DAYS: i64 = 365;

pub struct LeafCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Holds the root CA and the leaf cache. `getLeaf` is the sole public
/// entry point; everything else is internal bookkeeping.
pub struct CertStore {
    root: RootCa,
    cache: DashMap<String, Arc<OnceCell<Arc<LeafCert>>>>,
    inflight_lock: Mutex<()>,
}

impl CertStore {
    pub fn bootstrap(ca_cert_dir: &std::path::Path) -> Result<Self, CertError> {
        let paths = CaPaths::under(ca_cert_dir);
        let root = ca::load_or_create(&paths)?;
        Ok(Self {
            root,
            cache: DashMap::new(),
            inflight_lock: Mutex::new(()),
        })
    }

    pub fn root_cert_path(ca_cert_dir: &std::path::Path) -> std::path::PathBuf {
        CaPaths::under(ca_cert_dir).cert_path
    }

    /// Return the cached leaf for `hostname`, minting it if this is the
    /// first request for that hostname. Concurrent callers for an unseen
    /// hostname block on the same mint; callers for an already-cached
    /// hostname never block.
    pub async fn get_leaf(&self, hostname: &str) -> Result<Arc<LeafCert>, CertError> {
        // Fast path: already minted, no locking needed beyond DashMap's shard lock.
        if let Some(slot) = self.cache.get(hostname) {
            return slot
                .get_or_try_init(|| self.mint(hostname))
                .await
                .map(Arc::clone);
        }

        // Slow path: register (or find) the slot for this hostname under a
        // short critical section, then mint (or await the mint) outside it.
        let slot = {
            let _guard = self.inflight_lock.lock().await;
            self.cache
                .entry(hostname.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        slot.get_or_try_init(|| self.mint(hostname))
            .await
            .map(Arc::clone)
    }

    async fn mint(&self, hostname: &str) -> Result<Arc<LeafCert>, CertError> {
        let hostname = hostname.to_string();
        let root_key_pair_pem = self.root.key_pair.serialize_pem();
        let root_cert_pem = self.root.cert.pem();

        // Signing is CPU-bound; keep it off the async runtime's reactor thread.
        tokio::task::spawn_blocking(move || mint_leaf_sync(&hostname, &root_cert_pem, &root_key_pair_pem))
            .await
            .map_err(|e| CertError::Mint {
                hostname: "unknown".to_string(),
                reason: format!("mint task panicked: {e}"),
            })?
            .map(Arc::new)
    }
}

fn mint_leaf_sync(hostname: &str, root_cert_pem: &str, root_key_pem: &str) -> Result<LeafCert, CertError> {
    let ca_key = KeyPair::from_pem(root_key_pem).map_err(|e| CertError::Mint {
        hostname: hostname.to_string(),
        reason: e.to_string(),
    })?;
    let ca_params = CertificateParams::from_ca_cert_pem(root_cert_pem).map_err(|e| CertError::Mint {
        hostname: hostname.to_string(),
        reason: e.to_string(),
    })?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| CertError::Mint {
        hostname: hostname.to_string(),
        reason: e.to_string(),
    })?;

    let san = if let Ok(ip) = hostname.parse::<IpAddr>() {
        SanType::IpAddress(ip)
    } else {
        SanType::DnsName(hostname.try_into().map_err(|_| CertError::Mint {
            hostname: hostname.to_string(),
            reason: "hostname is not a valid DNS name".to_string(),
        })?)
    };

    let mut params = CertificateParams::new(vec![]).map_err(|e| CertError::Mint {
        hostname: hostname.to_string(),
        reason: e.to_string(),
    })?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![san];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let leaf_key = KeyPair::generate().map_err(|e| CertError::Mint {
        hostname: hostname.to_string(),
        reason: e.to_string(),
    })?;
    let leaf_cert = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| CertError::Mint {
            hostname: hostname.to_string(),
            reason: e.to_string(),
        })?;

    Ok(LeafCert {
        cert_der: leaf_cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("waylay-cert-test-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[tokio::test]
    async fn mints_and_caches_leaf_by_identity() {
        let dir = temp_dir();
        let store = StdArc::new(CertStore::bootstrap(&dir).unwrap());

        let leaf1 = store.get_leaf("example.org").await.unwrap();
        let leaf2 = store.get_leaf("example.org").await.unwrap();
        assert!(Arc::ptr_eq(&leaf1, &leaf2));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn concurrent_mints_for_fresh_hostname_share_one_result() {
        let dir = temp_dir();
        let store = StdArc::new(CertStore::bootstrap(&dir).unwrap());

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.get_leaf("concurrent.example").await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.get_leaf("concurrent.example").await.unwrap() })
        };

        let (leaf_a, leaf_b) = tokio::join!(a, b);
        assert!(Arc::ptr_eq(&leaf_a.unwrap(), &leaf_b.unwrap()));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn distinct_hostnames_get_distinct_leaves() {
        let dir = temp_dir();
        let store = CertStore::bootstrap(&dir).unwrap();

        let a = store.get_leaf("a.example").await.unwrap();
        let b = store.get_leaf("b.example").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn root_ca_persists_with_restricted_key_permissions() {
        let dir = temp_dir();
        let paths = CaPaths::under(&dir);
        let _ca = ca::load_or_create(&paths).unwrap();
        assert!(paths.cert_path.is_file());
        assert!(paths.key_path.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reloading_existing_ca_is_stable() {
        let dir = temp_dir();
        let paths = CaPaths::under(&dir);
        let first = ca::load_or_create(&paths).unwrap();
        let second = ca::load_or_create(&paths).unwrap();
        assert_eq!(first.cert.pem(), second.cert.pem());

        std::fs::remove_dir_all(&dir).ok();
    }
}
