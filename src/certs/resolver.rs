//! Decides where the serving certificate comes from.
//!
//! # Precedence
//! ```text
//! explicit cert+key exist           → Files(explicit)
//! well-known cert+key exist         → Files(well-known)
//! enable_ca && provider == builtin  → Dynamic
//! otherwise                         → None (plaintext only)
//! ```
//!
//! The CA root of a file-backed source is looked up separately: explicit CA
//! path, then the well-known CA path, then its alternate. A cert is never
//! paired with a key from a different location.

use std::path::{Path, PathBuf};

use crate::certs::bundle::CertPaths;
use crate::config::{CertOptions, CertProvider, KnownPaths, TlsOptions};

/// Outcome of source resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    /// Load from disk and watch for changes.
    Files(CertPaths),
    /// Request from the certificate authority on demand.
    Dynamic,
    /// No certificate; secure listeners stay down.
    None,
}

impl CertificateSource {
    pub fn is_available(&self) -> bool {
        !matches!(self, CertificateSource::None)
    }
}

/// Resolve the certificate source. Only checks for file existence.
pub fn resolve(tls: &TlsOptions, certs: &CertOptions) -> CertificateSource {
    let known = &certs.known_paths;

    if let Some(paths) = explicit_pair(tls).and_then(|(cert, key)| {
        existing_pair(cert, key, ca_root(tls.ca_cert_file.as_deref(), known))
    }) {
        tracing::info!(cert = %paths.cert.display(), "Using explicitly configured certificate");
        return CertificateSource::Files(paths);
    }

    let known_ca = ca_root(tls.ca_cert_file.as_deref(), known);
    if let Some(paths) = existing_pair(&known.cert, &known.key, known_ca) {
        tracing::info!(cert = %paths.cert.display(), "Using certificate from well-known location");
        return CertificateSource::Files(paths);
    }

    if certs.enable_ca && certs.provider == CertProvider::Builtin {
        tracing::info!("No certificate on disk, serving certificate will be issued dynamically");
        return CertificateSource::Dynamic;
    }

    tracing::warn!(
        enable_ca = certs.enable_ca,
        provider = ?certs.provider,
        "No certificate source available, secure listeners will not start"
    );
    CertificateSource::None
}

fn explicit_pair(tls: &TlsOptions) -> Option<(&Path, &Path)> {
    let cert = non_empty(tls.cert_file.as_deref())?;
    let key = non_empty(tls.key_file.as_deref())?;
    Some((cert, key))
}

fn existing_pair(cert: &Path, key: &Path, ca: Option<PathBuf>) -> Option<CertPaths> {
    (cert.is_file() && key.is_file()).then(|| CertPaths {
        cert: cert.to_path_buf(),
        key: key.to_path_buf(),
        ca,
    })
}

fn ca_root(explicit: Option<&Path>, known: &KnownPaths) -> Option<PathBuf> {
    [non_empty(explicit), Some(known.ca.as_path()), Some(known.ca_alternate.as_path())]
        .into_iter()
        .flatten()
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}
