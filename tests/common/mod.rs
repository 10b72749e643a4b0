//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mesh_bootstrap::config::{BootstrapConfig, CertProvider, KnownPaths};
use mesh_bootstrap::{Server, Shutdown};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A throwaway CA that issues server and client certificates.
pub struct TestCa {
    key: KeyPair,
    pub cert_pem: String,
}

/// A PEM certificate and key.
pub struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "test root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            key,
            cert_pem: cert.pem(),
        }
    }

    pub fn issue_server(&self) -> Issued {
        self.issue(ExtendedKeyUsagePurpose::ServerAuth)
    }

    pub fn issue_client(&self) -> Issued {
        self.issue(ExtendedKeyUsagePurpose::ClientAuth)
    }

    fn issue(&self, usage: ExtendedKeyUsagePurpose) -> Issued {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();
        let cert = params.signed_by(&key, &issuer).unwrap();
        Issued {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

/// Certificate file locations inside a temp dir.
pub struct CertDir {
    pub dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl CertDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            cert: dir.path().join("cert-chain.pem"),
            key: dir.path().join("key.pem"),
            ca: dir.path().join("root-cert.pem"),
            dir,
        }
    }

    pub fn write(&self, issued: &Issued, ca: Option<&TestCa>) {
        std::fs::write(&self.cert, &issued.cert_pem).unwrap();
        std::fs::write(&self.key, &issued.key_pem).unwrap();
        if let Some(ca) = ca {
            std::fs::write(&self.ca, &ca.cert_pem).unwrap();
        }
    }
}

/// Known paths under `root` that do not exist unless a test creates them.
pub fn known_paths(root: &Path) -> KnownPaths {
    KnownPaths {
        cert: root.join("tls/tls.crt"),
        key: root.join("tls/tls.key"),
        ca: root.join("tls/ca.crt"),
        ca_alternate: root.join("ca/root-cert.pem"),
    }
}

/// All listeners on ephemeral loopback ports, no certificate source.
pub fn base_config(known_root: &Path) -> BootstrapConfig {
    let mut config = BootstrapConfig::default();
    config.server.http_addr = Some("127.0.0.1:0".into());
    config.server.https_addr = Some("127.0.0.1:0".into());
    config.server.grpc_addr = None;
    config.server.secure_grpc_addr = Some("127.0.0.1:0".into());
    config.server.shutdown_grace_ms = 500;
    config.certs.enable_ca = false;
    config.certs.provider = CertProvider::None;
    config.certs.known_paths = known_paths(known_root);
    config.certs.watch_debounce_ms = 50;
    config
}

/// A server plus the shutdown handle that stops it.
pub struct Running {
    pub server: Server,
    pub shutdown: Shutdown,
}

impl Running {
    pub async fn start(config: BootstrapConfig) -> Self {
        let shutdown = Shutdown::new();
        let server = Server::start(config, &shutdown).await.unwrap();
        Self { server, shutdown }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.server.wait_until_completion())
            .await
            .unwrap();
    }
}

/// Reserve a loopback port by binding and releasing it.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn certs(pem: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap()
}

pub fn key(pem: &str) -> PrivateKeyDer<'static> {
    rustls_pemfile::private_key(&mut pem.as_bytes()).unwrap().unwrap()
}

/// Client-side handshake options.
pub struct ClientOptions<'a> {
    pub roots: Vec<CertificateDer<'static>>,
    pub suites: Option<Vec<SupportedCipherSuite>>,
    pub versions: &'a [&'static SupportedProtocolVersion],
    pub identity: Option<&'a Issued>,
}

impl<'a> ClientOptions<'a> {
    pub fn trusting(roots: Vec<CertificateDer<'static>>) -> Self {
        Self {
            roots,
            suites: None,
            versions: rustls::ALL_VERSIONS,
            identity: None,
        }
    }
}

pub fn connector(options: &ClientOptions<'_>) -> TlsConnector {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(suites) = &options.suites {
        provider.cipher_suites = suites.clone();
    }
    let mut roots = RootCertStore::empty();
    for cert in &options.roots {
        roots.add(cert.clone()).unwrap();
    }
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(options.versions)
        .unwrap()
        .with_root_certificates(roots);
    let config = match options.identity {
        Some(issued) => builder
            .with_client_auth_cert(certs(&issued.cert_pem), key(&issued.key_pem))
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    TlsConnector::from(Arc::new(config))
}

/// Complete a TLS handshake and return the server's leaf certificate.
pub async fn handshake(
    addr: SocketAddr,
    connector: &TlsConnector,
) -> std::io::Result<CertificateDer<'static>> {
    let tcp = TcpStream::connect(addr).await?;
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await?;
    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .cloned()
        .ok_or_else(|| std::io::Error::other("server sent no certificate"))?;
    Ok(leaf)
}

/// Send one HTTP/1.1 request over TLS and return the raw response.
///
/// Errors cover both a failed handshake and a connection the server closed
/// after a late handshake failure.
pub async fn https_request(
    addr: SocketAddr,
    connector: &TlsConnector,
    request: &str,
) -> std::io::Result<String> {
    let tcp = TcpStream::connect(addr).await?;
    let mut stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    // A peer that skips close_notify surfaces as an error after the body.
    if let Err(e) = stream.read_to_end(&mut response).await {
        if response.is_empty() {
            return Err(e);
        }
    }
    let response = String::from_utf8_lossy(&response).into_owned();
    if response.starts_with("HTTP/") {
        Ok(response)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "no HTTP response",
        ))
    }
}

pub const READY_REQUEST: &str =
    "GET /ready HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

pub const GRPC_REQUEST: &str = "POST /mesh.Discovery/Stream HTTP/1.1\r\nHost: localhost\r\n\
content-type: application/grpc\r\ncontent-length: 0\r\nConnection: close\r\n\r\n";
