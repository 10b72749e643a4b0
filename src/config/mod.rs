//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, eager JWT rule parse)
//!     → BootstrapConfig (validated, immutable)
//!     → shared by reference with every subsystem at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the server starts; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AuthOptions, BootstrapConfig, CertOptions, CertProvider, KnownPaths, ObservabilityConfig,
    ServerOptions, TlsOptions, TlsVersion,
};
