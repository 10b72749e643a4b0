//! TLS handshake configuration.
//!
//! # Data Flow
//! ```text
//! TlsOptions → policy.rs (allowed suites, version range)
//! BundleCache → acceptor.rs (rustls ServerConfig per bundle generation)
//!     → tokio-rustls TlsAcceptor used by the multiplexer
//! ```
//!
//! # Design Decisions
//! - The ring provider is selected explicitly everywhere; the process-wide
//!   default provider is never consulted.

pub mod acceptor;
pub mod policy;

use rustls::crypto::CryptoProvider;

pub use acceptor::{AcceptorCache, ClientAuth};
pub use policy::{PolicyError, TlsPolicy};

/// The crypto provider all TLS configuration is built from.
pub fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}
