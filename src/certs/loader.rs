//! Dynamic certificate loader.
//!
//! Issues the serving certificate from a `CertificateAuthority` when no
//! file-backed certificate exists.
//!
//! # Data Flow
//! ```text
//! get_or_create(hosts)
//!     → cache hit and not due for renewal → return
//!     → lock (one issuance in flight)
//!     → generate key + CSR → authority.sign (bounded by timeout)
//!     → CertificateBundle (pairing checked) → BundleCache::set
//! ```
//!
//! # Design Decisions
//! - Renewal starts `renew_before` ahead of expiry. If renewal fails while the
//!   current certificate is still valid, the current one keeps being served
//!   and the authority is not asked again until `retry_backoff` has passed.
//! - A loader without an authority fails with `NoIssuer`, never with an empty
//!   bundle, so callers can tell "not yet issued" from "never issued".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rcgen::{CertificateParams, KeyPair};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::certs::authority::{AuthorityError, CertificateAuthority, CertificateSigningRequest};
use crate::certs::bundle::{BundleError, CertificateBundle};
use crate::certs::cache::BundleCache;

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("no certificate issuer available")]
    NoIssuer,
    #[error("failed to prepare signing request: {0}")]
    Request(String),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("certificate authority did not answer within {0:?}")]
    Timeout(Duration),
    #[error("issued certificate is unusable: {0}")]
    Bundle(#[from] BundleError),
}

/// Lifetimes used when requesting certificates.
#[derive(Debug, Clone, Copy)]
pub struct IssuancePolicy {
    pub ttl: Duration,
    pub renew_before: Duration,
    pub timeout: Duration,
    /// Quiet period after a failed renewal while a valid certificate exists.
    pub retry_backoff: Duration,
}

pub struct DynamicCertLoader {
    authority: Option<Arc<dyn CertificateAuthority>>,
    cache: BundleCache,
    identity: String,
    policy: IssuancePolicy,
    /// Held while issuing; records when the last renewal failed.
    issuing: Mutex<Option<Instant>>,
    stale: AtomicBool,
    reset_backoff: AtomicBool,
}

impl DynamicCertLoader {
    pub fn new(
        authority: Option<Arc<dyn CertificateAuthority>>,
        cache: BundleCache,
        identity: impl Into<String>,
        policy: IssuancePolicy,
    ) -> Self {
        Self {
            authority,
            cache,
            identity: identity.into(),
            policy,
            issuing: Mutex::new(None),
            stale: AtomicBool::new(false),
            reset_backoff: AtomicBool::new(false),
        }
    }

    /// A loader that can never issue.
    pub fn disabled(cache: BundleCache) -> Self {
        Self::new(
            None,
            cache,
            "",
            IssuancePolicy {
                ttl: Duration::ZERO,
                renew_before: Duration::ZERO,
                timeout: Duration::ZERO,
                retry_backoff: Duration::ZERO,
            },
        )
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    /// Return the current certificate, issuing one first if there is none or
    /// it is due for renewal.
    pub async fn get_or_create(
        &self,
        hosts: &[String],
    ) -> Result<Arc<CertificateBundle>, IssuanceError> {
        let authority = self.authority.as_ref().ok_or(IssuanceError::NoIssuer)?;

        if let Some(bundle) = self.fresh() {
            return Ok(bundle);
        }

        let mut last_failure = self.issuing.lock().await;
        // Another caller may have issued while we waited.
        if let Some(bundle) = self.fresh() {
            return Ok(bundle);
        }
        if self.reset_backoff.swap(false, Ordering::AcqRel) {
            *last_failure = None;
        }
        if let Some(failed_at) = *last_failure {
            if failed_at.elapsed() < self.policy.retry_backoff {
                if let Some(current) = self.valid() {
                    return Ok(current);
                }
            }
        }

        match self.issue(authority.as_ref(), hosts).await {
            Ok(bundle) => {
                *last_failure = None;
                self.stale.store(false, Ordering::Release);
                self.cache.set(Arc::clone(&bundle));
                tracing::info!(
                    identity = %self.identity,
                    hosts = ?hosts,
                    not_after = ?bundle.not_after(),
                    "Issued serving certificate"
                );
                Ok(bundle)
            }
            Err(e) => match self.valid() {
                Some(current) => {
                    *last_failure = Some(Instant::now());
                    tracing::warn!(
                        error = %e,
                        retry_in = ?self.policy.retry_backoff,
                        "Certificate renewal failed, serving current certificate"
                    );
                    Ok(current)
                }
                _ => {
                    tracing::error!(error = %e, "Certificate issuance failed");
                    Err(e)
                }
            },
        }
    }

    /// Issue the first certificate before any listener accepts connections.
    pub async fn prewarm(&self, hosts: &[String]) -> Result<(), IssuanceError> {
        self.get_or_create(hosts).await.map(|_| ())
    }

    /// Force re-issuance on the next call, e.g. after the CA rotated its key.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
        self.reset_backoff.store(true, Ordering::Release);
        tracing::info!("Serving certificate invalidated");
    }

    fn fresh(&self) -> Option<Arc<CertificateBundle>> {
        if self.stale.load(Ordering::Acquire) {
            return None;
        }
        self.cache
            .get()
            .filter(|b| !b.expires_within(self.policy.renew_before))
    }

    fn valid(&self) -> Option<Arc<CertificateBundle>> {
        self.cache.get().filter(|b| !b.expires_within(Duration::ZERO))
    }

    async fn issue(
        &self,
        authority: &dyn CertificateAuthority,
        hosts: &[String],
    ) -> Result<Arc<CertificateBundle>, IssuanceError> {
        let key = KeyPair::generate().map_err(|e| IssuanceError::Request(e.to_string()))?;
        let pem = CertificateParams::new(hosts.to_vec())
            .and_then(|params| params.serialize_request(&key))
            .and_then(|csr| csr.pem())
            .map_err(|e| IssuanceError::Request(e.to_string()))?;
        let csr = CertificateSigningRequest {
            pem,
            hosts: hosts.to_vec(),
            ttl: self.policy.ttl,
        };

        let signed = tokio::time::timeout(self.policy.timeout, authority.sign(&csr, &self.identity))
            .await
            .map_err(|_| IssuanceError::Timeout(self.policy.timeout))??;

        let bundle = CertificateBundle::from_pem(
            signed.cert_chain_pem.as_bytes(),
            key.serialize_pem().as_bytes(),
            signed.root_cert_pem.as_ref().map(|pem| pem.as_bytes()),
        )?;
        Ok(Arc::new(bundle))
    }
}

impl std::fmt::Debug for DynamicCertLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertLoader")
            .field("identity", &self.identity)
            .field("has_authority", &self.authority.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}
