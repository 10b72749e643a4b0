//! Certificate authority seam.
//!
//! The loader only speaks to `CertificateAuthority`; the signing protocol
//! behind it is opaque. `BuiltinAuthority` is the in-process implementation
//! used when the built-in CA provider is selected.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("invalid signing request: {0}")]
    InvalidRequest(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),
}

/// A PEM-encoded CSR plus the hosts and lifetime being asked for.
#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    pub pem: String,
    pub hosts: Vec<String>,
    pub ttl: Duration,
}

/// Signed leaf (and any intermediates) plus the root that anchors it.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub cert_chain_pem: String,
    pub root_cert_pem: Option<String>,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Sign `csr` for `identity`. May be slow or unavailable.
    async fn sign(
        &self,
        csr: &CertificateSigningRequest,
        identity: &str,
    ) -> Result<SignedCertificate, AuthorityError>;
}

/// In-process CA backed by rcgen.
pub struct BuiltinAuthority {
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl BuiltinAuthority {
    /// Generate a fresh self-signed root for `trust_domain`.
    pub fn generate(trust_domain: &str) -> Result<Self, AuthorityError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, trust_domain);
        dn.push(DnType::CommonName, "mesh root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(3650);

        let ca_key = KeyPair::generate().map_err(|e| AuthorityError::Signing(e.to_string()))?;
        let cert = params
            .self_signed(&ca_key)
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;

        tracing::info!(trust_domain, "Generated self-signed root CA");
        Ok(Self {
            ca_key,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Use an existing root certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, AuthorityError> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| AuthorityError::InvalidRequest(format!("CA key: {e}")))?;
        // Fail now rather than on the first signing request.
        Issuer::from_ca_cert_pem(cert_pem, &ca_key)
            .map_err(|e| AuthorityError::InvalidRequest(format!("CA certificate: {e}")))?;
        Ok(Self {
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    pub fn from_files(cert: &Path, key: &Path) -> Result<Self, AuthorityError> {
        let read = |p: &Path| {
            std::fs::read_to_string(p)
                .map_err(|e| AuthorityError::Unavailable(format!("{}: {e}", p.display())))
        };
        let authority = Self::from_pem(&read(cert)?, &read(key)?)?;
        tracing::info!(cert = %cert.display(), "Loaded root CA from disk");
        Ok(authority)
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn sign_blocking(
        &self,
        csr: &CertificateSigningRequest,
        identity: &str,
    ) -> Result<SignedCertificate, AuthorityError> {
        if csr.hosts.is_empty() {
            return Err(AuthorityError::InvalidRequest("no hosts requested".into()));
        }
        let mut request = CertificateSigningRequestParams::from_pem(&csr.pem)
            .map_err(|e| AuthorityError::InvalidRequest(e.to_string()))?;

        // Subject, usage, and lifetime are decided here, not by the requester.
        let params = &mut request.params;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = csr
            .hosts
            .iter()
            .map(|host| san(host))
            .collect::<Result<_, _>>()?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + csr.ttl;

        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &self.ca_key)
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;
        let cert = request
            .signed_by(&issuer)
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;

        Ok(SignedCertificate {
            cert_chain_pem: cert.pem(),
            root_cert_pem: Some(self.ca_cert_pem.clone()),
        })
    }
}

#[async_trait]
impl CertificateAuthority for BuiltinAuthority {
    async fn sign(
        &self,
        csr: &CertificateSigningRequest,
        identity: &str,
    ) -> Result<SignedCertificate, AuthorityError> {
        self.sign_blocking(csr, identity)
    }
}

fn san(host: &str) -> Result<SanType, AuthorityError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    host.to_string()
        .try_into()
        .map(SanType::DnsName)
        .map_err(|e: rcgen::Error| AuthorityError::InvalidRequest(format!("host {host:?}: {e}")))
}
