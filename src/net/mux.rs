//! Per-listener accept loop and protocol dispatch.
//!
//! # Data Flow
//! ```text
//! accept (permit + connection guard)
//!     → sniff ──Tls──→ ServingIdentity::current → AcceptorCache → handshake
//!     │                   → ALPN h2 ? HTTP/2 : HTTP/1.1 → secure RouteTable
//!     ├──H2c──→ HTTP/2 → plaintext RouteTable
//!     └──Http1→ HTTP/1.1 → plaintext RouteTable
//!                  └──Upgrade: h2c→ 101 → HTTP/2 on the same socket
//! ```
//!
//! # Design Decisions
//! - The bundle is read once when the handshake starts, so the certificate is
//!   fixed for the connection even if the cache is swapped mid-handshake.
//! - Plaintext HTTP/1.1 connections may switch to HTTP/2 with `Upgrade: h2c`;
//!   the upgrading request is answered on stream 1 (see `h2c.rs`).
//! - On shutdown the listener closes first, then connections get the grace
//!   period to finish before they are aborted.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::Instrument;

use crate::certs::{BundleCache, CertificateBundle, DynamicCertLoader, IssuanceError};
use crate::http::{RouteTable, Routers};
use crate::net::connection::ConnectionTracker;
use crate::net::h2c::{self, H2cUpgrade};
use crate::net::listener::{Listener, ListenerError, ListenerSpec, Role};
use crate::net::sniff::{sniff, Protocol};
use crate::tls::{AcceptorCache, ClientAuth, PolicyError, TlsPolicy};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol detection failed: {0}")]
    Sniff(io::Error),
    #[error("{0:?} is not served on this listener")]
    Unsupported(Protocol),
    #[error("no serving certificate available")]
    NoCertificate,
    #[error(transparent)]
    Issuance(#[from] IssuanceError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    #[error("h2c upgrade failed: {0}")]
    Upgrade(io::Error),
    #[error("connection error: {0}")]
    Serve(Box<dyn std::error::Error + Send + Sync>),
}

/// Verified client certificate chain, attached to requests on mTLS connections.
#[derive(Debug, Clone)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

/// Where TLS handshakes get their certificate.
#[derive(Debug, Clone)]
pub struct ServingIdentity {
    cache: BundleCache,
    loader: Option<Arc<DynamicCertLoader>>,
    hosts: Arc<[String]>,
}

impl ServingIdentity {
    /// Serve whatever the cache holds (file-backed certificates).
    pub fn cached(cache: BundleCache) -> Self {
        Self {
            cache,
            loader: None,
            hosts: Arc::from(Vec::new()),
        }
    }

    /// Issue on demand through `loader`.
    pub fn dynamic(loader: Arc<DynamicCertLoader>, hosts: Vec<String>) -> Self {
        Self {
            cache: loader.cache().clone(),
            loader: Some(loader),
            hosts: Arc::from(hosts),
        }
    }

    /// The bundle to present right now.
    pub async fn current(&self) -> Result<Arc<CertificateBundle>, ConnectionError> {
        match &self.loader {
            Some(loader) => Ok(loader.get_or_create(&self.hosts).await?),
            None => self.cache.get().ok_or(ConnectionError::NoCertificate),
        }
    }
}

/// Timing knobs shared by every connection on a listener.
#[derive(Debug, Clone, Copy)]
pub struct MuxSettings {
    pub max_connections: usize,
    pub sniff_timeout: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

struct TlsSide {
    identity: ServingIdentity,
    acceptors: AcceptorCache,
}

struct Dispatch {
    plain: RouteTable,
    secure: RouteTable,
    tls: Option<TlsSide>,
    settings: MuxSettings,
}

/// One bound address serving the roles of its `ListenerSpec`.
pub struct Multiplexer {
    spec: ListenerSpec,
    listener: Listener,
    dispatch: Arc<Dispatch>,
    tracker: ConnectionTracker,
}

impl Multiplexer {
    pub async fn bind(
        spec: ListenerSpec,
        routers: &Routers,
        tls: Option<(ServingIdentity, Arc<TlsPolicy>)>,
        settings: MuxSettings,
    ) -> Result<Self, ListenerError> {
        let secure = RouteTable::for_spec(&spec, true, routers);
        let tls = tls.filter(|_| !secure.is_empty()).map(|(identity, policy)| {
            let client_auth = if spec.serves(Role::SecureGrpc) {
                ClientAuth::Required
            } else {
                ClientAuth::Disabled
            };
            TlsSide {
                identity,
                acceptors: AcceptorCache::new(policy, client_auth),
            }
        });
        let dispatch = Dispatch {
            plain: RouteTable::for_spec(&spec, false, routers),
            secure,
            tls,
            settings,
        };

        let listener = Listener::bind(spec.address, settings.max_connections).await?;
        Ok(Self {
            spec,
            listener,
            dispatch: Arc::new(dispatch),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// Accept until shutdown, then drain.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Multiplexer {
            spec,
            listener,
            dispatch,
            tracker,
        } = self;
        let address = listener.local_addr().unwrap_or(spec.address);
        tracing::info!(%address, roles = ?spec.roles, class = ?spec.class(), "Listener serving");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = tracker.track();
                        let drain = tracker.drain_receiver();
                        let dispatch = Arc::clone(&dispatch);
                        let span = tracing::debug_span!("connection", id = %guard.id(), %peer);
                        connections.spawn(
                            async move {
                                if let Err(e) = dispatch.handle(stream, peer, drain).await {
                                    tracing::debug!(error = %e, "Connection closed with error");
                                }
                                drop(guard);
                                drop(permit);
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(%address, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        tracker.begin_drain();
        let grace = dispatch.settings.shutdown_grace;
        tracing::info!(%address, active = tracker.active_count(), ?grace, "Listener draining");
        if !tracker.wait_for_drain(grace).await {
            tracing::warn!(
                %address,
                remaining = tracker.active_count(),
                "Grace period expired, closing connections"
            );
            connections.abort_all();
        }
        while connections.join_next().await.is_some() {}
        tracing::info!(%address, "Listener stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum HttpVersion {
    Http1 { h2c: bool },
    Http2,
}

impl Dispatch {
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        drain: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let protocol = sniff(&stream, self.settings.sniff_timeout)
            .await
            .map_err(ConnectionError::Sniff)?;
        tracing::trace!(?protocol, "Protocol detected");

        match protocol {
            Protocol::Tls => {
                let tls = self.tls.as_ref().ok_or(ConnectionError::Unsupported(protocol))?;
                let bundle = tls.identity.current().await?;
                let acceptor = tls.acceptors.acceptor_for(bundle)?;
                let handshake = acceptor.accept(stream);
                let stream = tokio::time::timeout(self.settings.handshake_timeout, handshake)
                    .await
                    .map_err(|_| ConnectionError::HandshakeTimeout)?
                    .map_err(ConnectionError::Handshake)?;

                let (_, session) = stream.get_ref();
                let version = match session.alpn_protocol() {
                    Some(b"h2") => HttpVersion::Http2,
                    _ => HttpVersion::Http1 { h2c: false },
                };
                let peer_certs = session
                    .peer_certificates()
                    .map(|chain| PeerCertificates(Arc::new(chain.to_vec())));
                serve(stream, version, self.secure.clone(), peer, peer_certs, drain).await
            }
            Protocol::H2c | Protocol::Http1 if !self.plain.is_empty() => {
                let version = if protocol == Protocol::H2c {
                    HttpVersion::Http2
                } else {
                    HttpVersion::Http1 { h2c: true }
                };
                serve(stream, version, self.plain.clone(), peer, None, drain).await
            }
            _ => Err(ConnectionError::Unsupported(protocol)),
        }
    }
}

async fn serve<I>(
    io: I,
    version: HttpVersion,
    routes: RouteTable,
    peer: SocketAddr,
    peer_certs: Option<PeerCertificates>,
    drain: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match version {
        HttpVersion::Http1 { h2c } => serve_http1(io, h2c, routes, peer, peer_certs, drain).await,
        HttpVersion::Http2 => serve_http2(io, routes, peer, peer_certs, drain).await,
    }
}

/// HTTP/1.1, switching to HTTP/2 in place when a plaintext client asks for
/// `Upgrade: h2c`.
async fn serve_http1<I>(
    io: I,
    allow_h2c: bool,
    routes: RouteTable,
    peer: SocketAddr,
    peer_certs: Option<PeerCertificates>,
    mut drain: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (upgrade_tx, mut upgrade_rx) = mpsc::unbounded_channel();
    let upgrade_routes = routes.clone();
    let service = service_fn(move |mut request: Request<Incoming>| {
        let upgrade = allow_h2c
            .then(|| H2cUpgrade::take(&mut request))
            .flatten()
            .and_then(|upgrade| upgrade_tx.send(upgrade).ok());
        let (routes, peer_certs) = (routes.clone(), peer_certs.clone());
        async move {
            if upgrade.is_some() {
                return Ok(h2c::switching_protocols());
            }
            respond(request, &routes, peer, peer_certs).await
        }
    });

    let builder = Builder::new(TokioExecutor::new());
    let builder = builder.http1_only();
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);
    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = drained(&mut drain) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(ConnectionError::Serve)?;

    let Ok(upgrade) = upgrade_rx.try_recv() else {
        return Ok(());
    };
    tracing::debug!("Switching to HTTP/2 after h2c upgrade");
    let io = upgrade.resume().await.map_err(ConnectionError::Upgrade)?;
    serve_http2(io, upgrade_routes, peer, None, drain).await
}

async fn serve_http2<I>(
    io: I,
    routes: RouteTable,
    peer: SocketAddr,
    peer_certs: Option<PeerCertificates>,
    mut drain: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let (routes, peer_certs) = (routes.clone(), peer_certs.clone());
        async move { respond(request, &routes, peer, peer_certs).await }
    });

    let builder = Builder::new(TokioExecutor::new());
    let builder = builder.http2_only();
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);
    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = drained(&mut drain) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(ConnectionError::Serve)
}

async fn respond(
    mut request: Request<Incoming>,
    routes: &RouteTable,
    peer: SocketAddr,
    peer_certs: Option<PeerCertificates>,
) -> Result<Response, Infallible> {
    request.extensions_mut().insert(ConnectInfo(peer));
    if let Some(certs) = peer_certs {
        request.extensions_mut().insert(certs);
    }
    match routes.select(&request) {
        Some(router) => router.oneshot(request).await,
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn drained(drain: &mut watch::Receiver<bool>) {
    let _ = drain.wait_for(|draining| *draining).await;
}
