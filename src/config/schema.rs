//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bootstrap
//! subsystem. All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the control-plane bootstrap.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Listener addresses and connection handling.
    pub server: ServerOptions,

    /// Serving certificate paths and handshake policy.
    pub tls: TlsOptions,

    /// Certificate sourcing (well-known paths, dynamic issuance).
    pub certs: CertOptions,

    /// Authentication settings for the secure gRPC path.
    pub auth: AuthOptions,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
///
/// An address left unset (or empty) disables that listener role.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Plaintext HTTP (HTTP/1.1 and h2c).
    pub http_addr: Option<String>,

    /// HTTPS.
    pub https_addr: Option<String>,

    /// Plain gRPC. When unset, gRPC is multiplexed onto `http_addr`.
    pub grpc_addr: Option<String>,

    /// Mutually-authenticated gRPC.
    pub secure_grpc_addr: Option<String>,

    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,

    /// Grace period for in-flight connections on shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,

    /// How long to wait for the first bytes of a connection, in milliseconds.
    pub sniff_timeout_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            http_addr: Some("0.0.0.0:8080".to_string()),
            https_addr: None,
            grpc_addr: None,
            secure_grpc_addr: Some("0.0.0.0:15012".to_string()),
            max_connections: 10_000,
            shutdown_grace_ms: 10_000,
            sniff_timeout_ms: 5_000,
        }
    }
}

impl ServerOptions {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

/// TLS protocol version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// Serving certificate configuration. Immutable once the server starts.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsOptions {
    /// Path to certificate chain file (PEM).
    pub cert_file: Option<PathBuf>,

    /// Path to private key file (PEM).
    pub key_file: Option<PathBuf>,

    /// Path to CA root file (PEM). Enables client certificate verification.
    pub ca_cert_file: Option<PathBuf>,

    /// Cipher-suite allow-list, by IANA name or hex id. Empty = provider default.
    pub cipher_suites: Vec<String>,

    /// Minimum protocol version.
    pub min_version: Option<TlsVersion>,

    /// Maximum protocol version.
    pub max_version: Option<TlsVersion>,
}

impl TlsOptions {
    /// True when the operator configured explicit certificate paths.
    pub fn has_explicit_paths(&self) -> bool {
        is_set(&self.cert_file) || is_set(&self.key_file)
    }
}

fn is_set(path: &Option<PathBuf>) -> bool {
    path.as_ref().is_some_and(|p| !p.as_os_str().is_empty())
}

/// Who supplies the serving certificate when no file-backed one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertProvider {
    /// The in-process certificate authority issues the certificate.
    #[default]
    Builtin,
    /// Certificates are mounted by the platform; never issued dynamically.
    Kubernetes,
    /// No provider.
    None,
}

/// Certificate sourcing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CertOptions {
    /// Enable dynamic issuance from the certificate authority.
    pub enable_ca: bool,

    /// Certificate provider.
    pub provider: CertProvider,

    /// Well-known default locations checked after explicit paths.
    pub known_paths: KnownPaths,

    /// DNS names the dynamically issued certificate is scoped to.
    pub host_aliases: Vec<String>,

    /// Optional root certificate for the built-in authority (PEM).
    pub ca_root_cert: Option<PathBuf>,

    /// Optional root key for the built-in authority (PEM).
    pub ca_root_key: Option<PathBuf>,

    /// Lifetime of dynamically issued certificates, in seconds.
    pub workload_ttl_secs: u64,

    /// Re-issue this long before expiry, in seconds.
    pub renew_before_secs: u64,

    /// Deadline for a single signing request, in milliseconds.
    pub issue_timeout_ms: u64,

    /// Wait after a failed renewal before asking the authority again, in seconds.
    pub renew_retry_secs: u64,

    /// Quiet period used to coalesce filesystem events, in milliseconds.
    pub watch_debounce_ms: u64,
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            enable_ca: true,
            provider: CertProvider::Builtin,
            known_paths: KnownPaths::default(),
            host_aliases: vec!["localhost".to_string()],
            ca_root_cert: None,
            ca_root_key: None,
            workload_ttl_secs: 24 * 60 * 60,
            renew_before_secs: 60 * 60,
            issue_timeout_ms: 10_000,
            renew_retry_secs: 30,
            watch_debounce_ms: 100,
        }
    }
}

impl CertOptions {
    pub fn workload_ttl(&self) -> Duration {
        Duration::from_secs(self.workload_ttl_secs)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_secs)
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_millis(self.issue_timeout_ms)
    }

    pub fn renew_retry(&self) -> Duration {
        Duration::from_secs(self.renew_retry_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// Well-known certificate locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KnownPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    /// Fallback CA root location, checked after `ca`.
    pub ca_alternate: PathBuf,
}

impl Default for KnownPaths {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("/var/run/secrets/mesh/tls/tls.crt"),
            key: PathBuf::from("/var/run/secrets/mesh/tls/tls.key"),
            ca: PathBuf::from("/var/run/secrets/mesh/tls/ca.crt"),
            ca_alternate: PathBuf::from("/var/run/secrets/mesh/ca/root-cert.pem"),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthOptions {
    /// JSON-encoded JWT rule, validated eagerly at startup.
    pub jwt_rule: Option<String>,

    /// Trust domain; the default audience for JWT rules without audiences.
    pub trust_domain: String,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            jwt_rule: None,
            trust_domain: "cluster.local".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
