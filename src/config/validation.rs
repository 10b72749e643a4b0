//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listener addresses and value ranges
//! - Check explicitly configured certificate paths exist
//! - Parse the JWT rule eagerly so misconfiguration surfaces at startup
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BootstrapConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::auth::jwt::{JwtRule, JwtRuleError};
use crate::config::schema::BootstrapConfig;
use crate::net::listener::parse_bind_address;
use crate::tls::policy::{PolicyError, TlsPolicy};

/// A single semantic problem with the configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field}: invalid listen address {value:?}")]
    Address { field: &'static str, value: String },
    #[error("{field}: {path} does not exist")]
    MissingFile { field: &'static str, path: PathBuf },
    #[error("tls: cert_file and key_file must be configured together")]
    IncompletePair,
    #[error("tls: {0}")]
    Policy(#[from] PolicyError),
    #[error("auth.jwt_rule: {0}")]
    JwtRule(#[from] JwtRuleError),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("certs.host_aliases must not be empty when dynamic issuance is enabled")]
    NoHostAliases,
    #[error("certs: ca_root_cert and ca_root_key must be configured together")]
    IncompleteRoot,
    #[error("certs.renew_before_secs ({renew_before}) must be less than certs.workload_ttl_secs ({ttl})")]
    RenewalWindow { renew_before: u64, ttl: u64 },
}

/// Validate a loaded configuration, collecting every problem found.
pub fn validate_config(config: &BootstrapConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let server = &config.server;
    for (field, value) in [
        ("server.http_addr", &server.http_addr),
        ("server.https_addr", &server.https_addr),
        ("server.grpc_addr", &server.grpc_addr),
        ("server.secure_grpc_addr", &server.secure_grpc_addr),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            if parse_bind_address(value).is_none() {
                errors.push(ValidationError::Address {
                    field,
                    value: value.to_string(),
                });
            }
        }
    }
    if server.max_connections == 0 {
        errors.push(ValidationError::Zero("server.max_connections"));
    }
    if server.sniff_timeout_ms == 0 {
        errors.push(ValidationError::Zero("server.sniff_timeout_ms"));
    }

    let tls = &config.tls;
    if tls.has_explicit_paths() {
        match (non_empty(&tls.cert_file), non_empty(&tls.key_file)) {
            (Some(cert), Some(key)) => {
                check_exists(&mut errors, "tls.cert_file", cert);
                check_exists(&mut errors, "tls.key_file", key);
            }
            _ => errors.push(ValidationError::IncompletePair),
        }
    }
    if let Some(ca) = non_empty(&tls.ca_cert_file) {
        check_exists(&mut errors, "tls.ca_cert_file", ca);
    }
    if let Err(e) = TlsPolicy::from_options(tls) {
        errors.push(e.into());
    }

    let certs = &config.certs;
    if certs.enable_ca && certs.host_aliases.is_empty() {
        errors.push(ValidationError::NoHostAliases);
    }
    if certs.workload_ttl_secs == 0 {
        errors.push(ValidationError::Zero("certs.workload_ttl_secs"));
    } else if certs.renew_before_secs >= certs.workload_ttl_secs {
        errors.push(ValidationError::RenewalWindow {
            renew_before: certs.renew_before_secs,
            ttl: certs.workload_ttl_secs,
        });
    }
    match (non_empty(&certs.ca_root_cert), non_empty(&certs.ca_root_key)) {
        (Some(cert), Some(key)) => {
            check_exists(&mut errors, "certs.ca_root_cert", cert);
            check_exists(&mut errors, "certs.ca_root_key", key);
        }
        (None, None) => {}
        _ => errors.push(ValidationError::IncompleteRoot),
    }

    if let Some(rule) = config.auth.jwt_rule.as_deref().filter(|r| !r.is_empty()) {
        if let Err(e) = JwtRule::parse(rule) {
            errors.push(e.into());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn check_exists(errors: &mut Vec<ValidationError>, field: &'static str, path: &Path) {
    if !path.is_file() {
        errors.push(ValidationError::MissingFile {
            field,
            path: path.to_path_buf(),
        });
    }
}
