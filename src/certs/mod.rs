//! Serving certificate management.
//!
//! # Responsibilities
//! - Decide where the serving certificate comes from
//! - Keep it current as files change or the CA reissues it
//! - Publish it atomically to every listener
//!
//! # Data Flow
//! ```text
//! resolver ──Files──→ watcher ──┐
//!          ──Dynamic→ loader ───┼──→ BundleCache ──→ TLS acceptors (per handshake)
//!          ──None───→ plaintext only
//! ```
//!
//! # Design Decisions
//! - Exactly one writer per process: the resolver picks either the watcher or
//!   the loader, never both.
//! - A bundle is only built after its key has been checked against the leaf.

pub mod authority;
pub mod bundle;
pub mod cache;
pub mod loader;
pub mod resolver;
pub mod watcher;

pub use authority::{
    AuthorityError, BuiltinAuthority, CertificateAuthority, CertificateSigningRequest,
    SignedCertificate,
};
pub use bundle::{BundleError, CertPaths, CertificateBundle};
pub use cache::BundleCache;
pub use loader::{DynamicCertLoader, IssuanceError, IssuancePolicy};
pub use resolver::{resolve, CertificateSource};
pub use watcher::{CertWatcher, ReloadOutcome, WatchError};
