//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration and build the authenticators
//! - Resolve the certificate source and install the first bundle
//! - Bind listeners, then start the watcher and accept loops
//!
//! # Design Decisions
//! - Fail fast on configuration errors and unusable explicit certificates
//! - A CA that cannot issue yet is not fatal: handshakes retry issuance
//! - Everything is bound before any background task starts, so a bind
//!   failure leaves nothing running

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::auth::{init_oidc, Authenticators, JwtRuleError};
use crate::certs::{
    resolve, AuthorityError, BuiltinAuthority, BundleCache, BundleError, CertWatcher,
    CertificateAuthority, CertificateBundle, CertificateSource, DynamicCertLoader,
    IssuancePolicy, WatchError,
};
use crate::config::validation::validate_config;
use crate::config::{BootstrapConfig, CertOptions, ConfigError, ServerOptions};
use crate::http::{Readiness, Routers};
use crate::lifecycle::Shutdown;
use crate::net::{
    plan_listeners, ListenerError, ListenerSpec, Multiplexer, MuxSettings, Role, ServingIdentity,
};
use crate::tls::{PolicyError, TlsPolicy};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("auth.jwt_rule: {0}")]
    JwtRule(#[from] JwtRuleError),
    #[error("tls policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("serving certificate: {0}")]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("certificate authority: {0}")]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A running bootstrap server.
pub struct Server {
    cache: BundleCache,
    source: CertificateSource,
    loader: Option<Arc<DynamicCertLoader>>,
    listeners: Vec<(ListenerSpec, SocketAddr)>,
    authenticators: Authenticators,
    readiness: Readiness,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start serving. Background tasks stop when `shutdown` is triggered.
    pub async fn start(
        config: BootstrapConfig,
        shutdown: &Shutdown,
    ) -> Result<Self, BootstrapError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let trust_domain = &config.auth.trust_domain;
        let oidc = init_oidc(config.auth.jwt_rule.as_deref(), trust_domain)?;
        let authenticators = Authenticators::new(oidc);
        let policy = Arc::new(TlsPolicy::from_options(&config.tls)?);

        let cache = BundleCache::new();
        let source = resolve(&config.tls, &config.certs);
        let mut watcher = None;
        let mut loader = None;
        let identity = match &source {
            CertificateSource::Files(paths) => {
                let debounce = config.certs.watch_debounce();
                let w = CertWatcher::new(paths.clone(), cache.clone(), debounce);
                w.load_initial()?;
                watcher = Some(w);
                Some(ServingIdentity::cached(cache.clone()))
            }
            CertificateSource::Dynamic => {
                let l = Arc::new(dynamic_loader(&config.certs, trust_domain, cache.clone())?);
                let hosts = config.certs.host_aliases.clone();
                if let Err(e) = l.prewarm(&hosts).await {
                    tracing::warn!(
                        error = %e,
                        "Initial certificate issuance failed, will retry on first handshake"
                    );
                }
                loader = Some(Arc::clone(&l));
                Some(ServingIdentity::dynamic(l, hosts))
            }
            CertificateSource::None => None,
        };

        let readiness = Readiness::new();
        let routers = Routers::new(readiness.clone(), authenticators.clone());
        let settings = mux_settings(&config.server);

        let mut muxes = Vec::new();
        for spec in plan_listeners(&config.server, identity.is_some())? {
            let tls = identity.clone().map(|i| (i, Arc::clone(&policy)));
            muxes.push(Multiplexer::bind(spec, &routers, tls, settings).await?);
        }

        let mut tasks = Vec::with_capacity(muxes.len() + 1);
        if let Some(watcher) = watcher {
            tasks.push(watcher.spawn(shutdown.subscribe())?);
        }
        let mut listeners = Vec::with_capacity(muxes.len());
        for mux in muxes {
            let addr = mux.local_addr().map_err(|source| ListenerError::Bind {
                addr: mux.spec().address,
                source,
            })?;
            listeners.push((mux.spec().clone(), addr));
            tasks.push(tokio::spawn(mux.run(shutdown.subscribe())));
        }

        readiness.mark_ready();
        tracing::info!(
            source = ?source,
            listeners = ?listeners.iter().map(|(s, a)| (a, &s.roles)).collect::<Vec<_>>(),
            "Bootstrap server started"
        );

        Ok(Self {
            cache,
            source,
            loader,
            listeners,
            authenticators,
            readiness,
            tasks,
        })
    }

    /// Bound address of the listener serving `role`, if any.
    pub fn addr_for(&self, role: Role) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(spec, _)| spec.serves(role))
            .map(|(_, addr)| *addr)
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Role::Http)
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Role::Https)
    }

    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Role::Grpc)
    }

    pub fn secure_grpc_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Role::SecureGrpc)
    }

    pub fn listeners(&self) -> &[(ListenerSpec, SocketAddr)] {
        &self.listeners
    }

    /// The bundle currently presented on secure listeners.
    pub fn identity_certificate(&self) -> Option<Arc<CertificateBundle>> {
        self.cache.get()
    }

    pub fn bundle_cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn certificate_source(&self) -> &CertificateSource {
        &self.source
    }

    /// Present only when certificates are issued dynamically.
    pub fn loader(&self) -> Option<&Arc<DynamicCertLoader>> {
        self.loader.as_ref()
    }

    pub fn authenticators(&self) -> &Authenticators {
        &self.authenticators
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Wait for every listener and the watcher to finish after shutdown.
    pub async fn wait_until_completion(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }
        tracing::info!("Bootstrap server stopped");
    }
}

fn mux_settings(server: &ServerOptions) -> MuxSettings {
    MuxSettings {
        max_connections: server.max_connections,
        sniff_timeout: server.sniff_timeout(),
        handshake_timeout: server.sniff_timeout(),
        shutdown_grace: server.shutdown_grace(),
    }
}

fn dynamic_loader(
    certs: &CertOptions,
    trust_domain: &str,
    cache: BundleCache,
) -> Result<DynamicCertLoader, AuthorityError> {
    let configured =
        |p: &Option<std::path::PathBuf>| p.clone().filter(|p| !p.as_os_str().is_empty());
    let authority = match (configured(&certs.ca_root_cert), configured(&certs.ca_root_key)) {
        (Some(cert), Some(key)) => BuiltinAuthority::from_files(&cert, &key)?,
        _ => BuiltinAuthority::generate(trust_domain)?,
    };
    let authority: Arc<dyn CertificateAuthority> = Arc::new(authority);
    let policy = IssuancePolicy {
        ttl: certs.workload_ttl(),
        renew_before: certs.renew_before(),
        timeout: certs.issue_timeout(),
        retry_backoff: certs.renew_retry(),
    };
    Ok(DynamicCertLoader::new(
        Some(authority),
        cache,
        format!("spiffe://{trust_domain}/mesh-bootstrap"),
        policy,
    ))
}
