//! Certificate bundle: a certificate chain and its private key as one unit.
//!
//! A bundle can only be constructed after the key has been checked against the
//! leaf certificate, so every bundle in circulation is internally consistent.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{Error as RustlsError, InconsistentKeys};
use thiserror::Error;

use crate::tls::crypto_provider;

/// Errors building a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed PEM: {0}")]
    Pem(std::io::Error),
    #[error("no certificate found")]
    NoCertificate,
    #[error("no private key found")]
    NoPrivateKey,
    #[error("unsupported private key: {0}")]
    Key(RustlsError),
    #[error("private key does not match the leaf certificate")]
    Mismatch,
    #[error("invalid leaf certificate: {0}")]
    Certificate(String),
}

/// File locations of a file-backed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Option<PathBuf>,
}

/// The serving identity: certificate chain, matching private key, optional CA roots.
pub struct CertificateBundle {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_roots: Vec<CertificateDer<'static>>,
    not_after: Option<SystemTime>,
    certified: Arc<CertifiedKey>,
}

impl CertificateBundle {
    /// Build a bundle from DER material, verifying the key pairs with the leaf.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        ca_roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, BundleError> {
        let leaf = chain.first().ok_or(BundleError::NoCertificate)?;
        let not_after = leaf_not_after(leaf)?;

        let signing_key = crypto_provider()
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(BundleError::Key)?;
        let certified = CertifiedKey::new(chain.clone(), signing_key);
        match certified.keys_match() {
            Ok(()) => {}
            // The provider cannot derive a public key for this key type; the
            // handshake will still fail loudly if the pair is wrong.
            Err(RustlsError::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(_) => return Err(BundleError::Mismatch),
        }

        Ok(Self {
            chain,
            key,
            ca_roots,
            not_after,
            certified: Arc::new(certified),
        })
    }

    /// Build a bundle from PEM-encoded cert chain, key, and optional CA roots.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, BundleError> {
        let chain = parse_certs(cert_pem)?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(BundleError::Pem)?
            .ok_or(BundleError::NoPrivateKey)?;
        let ca_roots = match ca_pem {
            Some(pem) => parse_certs(pem)?,
            None => Vec::new(),
        };
        Self::new(chain, key, ca_roots)
    }

    /// Read all files from disk at call time and build a bundle.
    pub fn load(paths: &CertPaths) -> Result<Self, BundleError> {
        let cert = read(&paths.cert)?;
        let key = read(&paths.key)?;
        let ca = paths.ca.as_deref().map(read).transpose()?;
        Self::from_pem(&cert, &key, ca.as_deref())
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    pub fn ca_roots(&self) -> &[CertificateDer<'static>] {
        &self.ca_roots
    }

    /// Expiry of the leaf certificate.
    pub fn not_after(&self) -> Option<SystemTime> {
        self.not_after
    }

    /// The rustls signing material for this bundle.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// True when the leaf expires within `margin` of now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.not_after {
            Some(not_after) => SystemTime::now() + margin >= not_after,
            None => false,
        }
    }

    /// True when both bundles carry identical certificate, key, and roots.
    pub fn same_material(&self, other: &CertificateBundle) -> bool {
        self.chain == other.chain
            && self.key.secret_der() == other.key.secret_der()
            && self.ca_roots == other.ca_roots
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("chain_len", &self.chain.len())
            .field("ca_roots", &self.ca_roots.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, BundleError> {
    fs::read(path).map_err(|source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, BundleError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(BundleError::Pem)?;
    if certs.is_empty() {
        return Err(BundleError::NoCertificate);
    }
    Ok(certs)
}

fn leaf_not_after(leaf: &CertificateDer<'_>) -> Result<Option<SystemTime>, BundleError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| BundleError::Certificate(e.to_string()))?;
    let secs = cert.validity().not_after.timestamp();
    Ok(u64::try_from(secs)
        .ok()
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)))
}
