//! Authentication configuration for the secure gRPC path.
//!
//! # Data Flow
//! ```text
//! auth.jwt_rule (JSON string)
//!     → jwt.rs (structural validation)
//!     → JwtAuthenticator
//!     → Authenticators (attached to gRPC requests on secure listeners)
//! ```

pub mod jwt;

use std::sync::Arc;

pub use jwt::{init_oidc, JwtAuthenticator, JwtRule, JwtRuleError};

/// The authenticators available to handlers on secure gRPC listeners.
///
/// Client certificates are verified during the handshake; handlers find the
/// verified chain in the `PeerCertificates` request extension.
#[derive(Debug, Clone, Default)]
pub struct Authenticators {
    pub jwt: Option<Arc<JwtAuthenticator>>,
}

impl Authenticators {
    pub fn new(jwt: Option<JwtAuthenticator>) -> Self {
        Self {
            jwt: jwt.map(Arc::new),
        }
    }
}
