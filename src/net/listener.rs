//! Listener planning and bounded TCP accept.
//!
//! # Responsibilities
//! - Turn the configured listener roles into one spec per bind address
//! - Bind to those addresses
//! - Enforce max_connections via semaphore
//!
//! # Data Flow
//! ```text
//! ServerOptions
//!     → plan_listeners (roles grouped by address)
//!     → Listener::bind (one per ListenerSpec)
//!     → accept (permit held for the connection's lifetime)
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerOptions;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listen address {0:?}")]
    Address(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
    #[error("listener closed")]
    Closed,
}

/// A service a listener provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Http,
    Https,
    Grpc,
    SecureGrpc,
}

impl Role {
    pub fn is_secure(self) -> bool {
        matches!(self, Role::Https | Role::SecureGrpc)
    }

    pub fn is_grpc(self) -> bool {
        matches!(self, Role::Grpc | Role::SecureGrpc)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Http => "http",
            Role::Https => "https",
            Role::Grpc => "grpc",
            Role::SecureGrpc => "secure-grpc",
        };
        f.write_str(name)
    }
}

/// What kind of traffic a listener expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolClass {
    Plaintext,
    Secure,
    /// Plaintext and TLS on one address, decided per connection.
    Multiplexed,
}

/// One bind address and the roles served on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub address: SocketAddr,
    pub roles: Vec<Role>,
}

impl ListenerSpec {
    pub fn class(&self) -> ProtocolClass {
        let secure = self.roles.iter().any(|r| r.is_secure());
        let plain = self.roles.iter().any(|r| !r.is_secure());
        match (plain, secure) {
            (true, true) => ProtocolClass::Multiplexed,
            (false, true) => ProtocolClass::Secure,
            _ => ProtocolClass::Plaintext,
        }
    }

    pub fn serves(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Parse a listen address. `":8080"` binds all interfaces.
pub fn parse_bind_address(value: &str) -> Option<SocketAddr> {
    let value = value.trim();
    if let Some(port) = value.strip_prefix(':') {
        return port
            .parse()
            .ok()
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    value.parse().ok()
}

/// Group the configured roles into listener specs.
///
/// Secure roles are skipped when no certificate source is available. Roles on
/// the same address share a listener; port 0 never merges. Without a
/// dedicated gRPC address, plain gRPC rides on the HTTP listener.
pub fn plan_listeners(
    options: &ServerOptions,
    tls_available: bool,
) -> Result<Vec<ListenerSpec>, ListenerError> {
    let grpc_addr = match options.grpc_addr.as_deref() {
        None => options.http_addr.as_deref(),
        explicit => explicit,
    };
    let roles = [
        (Role::Http, options.http_addr.as_deref()),
        (Role::Grpc, grpc_addr),
        (Role::Https, options.https_addr.as_deref()),
        (Role::SecureGrpc, options.secure_grpc_addr.as_deref()),
    ];

    let mut specs: Vec<ListenerSpec> = Vec::new();
    for (role, value) in roles {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        if role.is_secure() && !tls_available {
            tracing::warn!(%role, address = value, "No serving certificate, listener disabled");
            continue;
        }
        let address = parse_bind_address(value)
            .ok_or_else(|| ListenerError::Address(value.to_string()))?;

        let shared = specs
            .iter_mut()
            .find(|s| address.port() != 0 && s.address == address);
        match shared {
            Some(spec) => spec.roles.push(role),
            // gRPC riding on an ephemeral HTTP port joins that listener.
            None if role == Role::Grpc && options.grpc_addr.is_none() => {
                if let Some(http) = specs.iter_mut().find(|s| s.serves(Role::Http)) {
                    http.roles.push(role);
                }
            }
            None => specs.push(ListenerSpec {
                address,
                roles: vec![role],
            }),
        }
    }
    Ok(specs)
}

/// A bounded TCP listener.
///
/// When `max_connections` is reached, accepting waits until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        tracing::info!(address = %local_addr, max_connections, "Listener bound");

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a connection. The permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot, released on drop even if the handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(http: &str, https: &str, grpc: Option<&str>, secure_grpc: &str) -> ServerOptions {
        ServerOptions {
            http_addr: Some(http.to_string()),
            https_addr: Some(https.to_string()),
            grpc_addr: grpc.map(str::to_string),
            secure_grpc_addr: Some(secure_grpc.to_string()),
            ..ServerOptions::default()
        }
    }

    #[test]
    fn parses_port_only_addresses() {
        assert_eq!(
            parse_bind_address(":15010"),
            Some("0.0.0.0:15010".parse().unwrap())
        );
        assert_eq!(parse_bind_address("[::1]:80"), Some("[::1]:80".parse().unwrap()));
        assert_eq!(parse_bind_address("localhost:80"), None);
        assert_eq!(parse_bind_address(":http"), None);
    }

    #[test]
    fn grpc_multiplexes_onto_http_by_default() {
        let server = options("127.0.0.1:8080", "", None, "127.0.0.1:15012");
        let specs = plan_listeners(&server, true).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].roles, vec![Role::Http, Role::Grpc]);
        assert_eq!(specs[0].class(), ProtocolClass::Plaintext);
        assert_eq!(specs[1].roles, vec![Role::SecureGrpc]);
        assert_eq!(specs[1].class(), ProtocolClass::Secure);
    }

    #[test]
    fn ephemeral_http_still_carries_grpc() {
        let specs = plan_listeners(&options("127.0.0.1:0", "127.0.0.1:0", None, ""), true).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].roles, vec![Role::Http, Role::Grpc]);
        assert_eq!(specs[1].roles, vec![Role::Https]);
    }

    #[test]
    fn shared_address_is_multiplexed() {
        let specs = plan_listeners(
            &options("0.0.0.0:8080", "0.0.0.0:8080", Some(""), "0.0.0.0:15012"),
            true,
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].roles, vec![Role::Http, Role::Https]);
        assert_eq!(specs[0].class(), ProtocolClass::Multiplexed);
    }

    #[test]
    fn secure_roles_need_a_certificate() {
        let server = options(":8080", ":8443", Some(":9090"), ":15012");
        let specs = plan_listeners(&server, false).unwrap();
        let roles: Vec<Role> = specs.iter().flat_map(|s| s.roles.clone()).collect();
        assert_eq!(roles, vec![Role::Http, Role::Grpc]);
    }

    #[test]
    fn rejects_bad_address() {
        assert!(matches!(
            plan_listeners(&options("nope", "", None, ""), true),
            Err(ListenerError::Address(_))
        ));
    }

    #[tokio::test]
    async fn accept_holds_permit() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let (_stream, _, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);
        drop(permit);
        assert_eq!(listener.available_permits(), listener.max_connections());
    }
}
