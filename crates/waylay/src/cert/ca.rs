//! Root CA bootstrap and on-disk persistence (C1, root half).

use crate::errors::CertError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const ROOT_COMMON_NAME: &str = "Waylay Root CA";
const ROOT_VALIDITY_YEARS: i64 = 10;

pub struct RootCa {
    pub cert: Certificate,
    pub key_pair: KeyPair,
}

/// Directory layout under `caCertDir`: `certs/ca.pem`, `keys/ca.key`.
pub struct CaPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaPaths {
    pub fn under(ca_cert_dir: &Path) -> Self {
        Self {
            cert_path: ca_cert_dir.join("certs").join("ca.pem"),
            key_path: ca_cert_dir.join("keys").join("ca.key"),
        }
    }
}

/// Load the root CA from disk, generating and persisting a fresh one on
/// first run. The private key never leaves `caCertDir`; only the certificate
/// is meant to be installed into client trust stores.
pub fn load_or_create(paths: &CaPaths) -> Result<RootCa, CertError> {
    if paths.cert_path.is_file() && paths.key_path.is_file() {
        return load(paths);
    }
    let ca = generate()?;
    persist(paths, &ca)?;
    Ok(ca)
}

fn load(paths: &CaPaths) -> Result<RootCa, CertError> {
    let cert_pem = std::fs::read_to_string(&paths.cert_path).map_err(|source| CertError::Io {
        path: paths.cert_path.display().to_string(),
        source,
    })?;
    let key_pem = std::fs::read_to_string(&paths.key_path).map_err(|source| CertError::Io {
        path: paths.key_path.display().to_string(),
        source,
    })?;

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Parse(e.to_string()))?;
    let params =
        CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| CertError::Parse(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Parse(e.to_string()))?;

    Ok(RootCa { cert, key_pair })
}

fn generate() -> Result<RootCa, CertError> {
    let key_pair = KeyPair::generate().map_err(|e| CertError::Parse(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(365 * ROOT_VALIDITY_YEARS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Parse(e.to_string()))?;

    Ok(RootCa { cert, key_pair })
}

fn persist(paths: &CaPaths, ca: &RootCa) -> Result<(), CertError> {
    for path in [&paths.cert_path, &paths.key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CertError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    std::fs::write(&paths.cert_path, ca.cert.pem()).map_err(|source| CertError::Io {
        path: paths.cert_path.display().to_string(),
        source,
    })?;

    std::fs::write(&paths.key_path, ca.key_pair.serialize_pem()).map_err(|source| CertError::Io {
        path: paths.key_path.display().to_string(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&paths.key_path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| CertError::Io {
                path: paths.key_path.display().to_string(),
                source,
            },
        )?;
    }

    Ok(())
}
