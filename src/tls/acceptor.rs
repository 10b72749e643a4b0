//! Per-bundle TLS acceptors.
//!
//! Building a `ServerConfig` is not free, so the acceptor for the current
//! bundle is cached and only rebuilt when the bundle cache hands out a
//! different bundle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_rustls::TlsAcceptor;

use crate::certs::CertificateBundle;
use crate::tls::policy::{PolicyError, TlsPolicy};

/// Whether clients must present a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    Disabled,
    /// Enforced whenever the bundle carries CA roots.
    Required,
}

struct Entry {
    bundle: Arc<CertificateBundle>,
    acceptor: TlsAcceptor,
}

pub struct AcceptorCache {
    policy: Arc<TlsPolicy>,
    client_auth: ClientAuth,
    current: ArcSwapOption<Entry>,
    warned_no_roots: AtomicBool,
}

impl AcceptorCache {
    pub fn new(policy: Arc<TlsPolicy>, client_auth: ClientAuth) -> Self {
        Self {
            policy,
            client_auth,
            current: ArcSwapOption::empty(),
            warned_no_roots: AtomicBool::new(false),
        }
    }

    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    /// The acceptor presenting `bundle`.
    pub fn acceptor_for(&self, bundle: Arc<CertificateBundle>) -> Result<TlsAcceptor, PolicyError> {
        if let Some(entry) = self.current.load().as_ref() {
            if Arc::ptr_eq(&entry.bundle, &bundle) {
                return Ok(entry.acceptor.clone());
            }
        }

        let verify = self.client_auth == ClientAuth::Required;
        if verify
            && bundle.ca_roots().is_empty()
            && !self.warned_no_roots.swap(true, Ordering::Relaxed)
        {
            tracing::warn!("No CA root configured, client certificates will not be verified");
        }

        let config = self.policy.server_config(&bundle, verify)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        self.current.store(Some(Arc::new(Entry {
            bundle,
            acceptor: acceptor.clone(),
        })));
        tracing::debug!(client_auth = ?self.client_auth, "Built TLS acceptor for new certificate");
        Ok(acceptor)
    }
}

impl std::fmt::Debug for AcceptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorCache")
            .field("client_auth", &self.client_auth)
            .field("cached", &self.current.load().is_some())
            .finish()
    }
}
