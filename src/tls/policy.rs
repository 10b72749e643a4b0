//! Cipher-suite and protocol-version policy.
//!
//! Suites are named by IANA name (`TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256`),
//! case-insensitively and with or without the `TLS_` prefix, or by hex id
//! (`0xC02B`). The allow-list constrains TLS 1.2 negotiation; TLS 1.3 suites
//! stay enabled unless the list names at least one of them.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use thiserror::Error;

use crate::certs::CertificateBundle;
use crate::config::{TlsOptions, TlsVersion};
use crate::tls::crypto_provider;

/// ALPN protocols offered on TLS listeners, most preferred first.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown cipher suite {0:?}")]
    UnknownCipherSuite(String),
    #[error("min_version {min} is above max_version {max}")]
    VersionRange { min: TlsVersion, max: TlsVersion },
    #[error("no configured cipher suite is usable with the configured versions")]
    NoUsableSuites,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error("client verifier: {0}")]
    Verifier(String),
}

/// Resolved handshake constraints. Immutable after startup.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    suites: Vec<SupportedCipherSuite>,
    versions: Vec<&'static SupportedProtocolVersion>,
}

impl TlsPolicy {
    pub fn from_options(options: &TlsOptions) -> Result<Self, PolicyError> {
        let available = crypto_provider().cipher_suites;

        let min = options.min_version.unwrap_or(TlsVersion::Tls12);
        let max = options.max_version.unwrap_or(TlsVersion::Tls13);
        if min > max {
            return Err(PolicyError::VersionRange { min, max });
        }
        let versions: Vec<&'static SupportedProtocolVersion> = [
            (TlsVersion::Tls12, &rustls::version::TLS12),
            (TlsVersion::Tls13, &rustls::version::TLS13),
        ]
        .into_iter()
        .filter(|(v, _)| (min..=max).contains(v))
        .map(|(_, version)| version)
        .collect();

        let suites = if options.cipher_suites.is_empty() {
            available
        } else {
            let mut selected = Vec::with_capacity(options.cipher_suites.len());
            for name in &options.cipher_suites {
                let suite = available
                    .iter()
                    .find(|s| suite_matches(s, name))
                    .ok_or_else(|| PolicyError::UnknownCipherSuite(name.clone()))?;
                if !selected.iter().any(|s: &SupportedCipherSuite| s.suite() == suite.suite()) {
                    selected.push(*suite);
                }
            }
            if !selected.iter().any(is_tls13) {
                selected.extend(available.iter().filter(|s| is_tls13(s)).copied());
            }
            selected
        };

        if !suites
            .iter()
            .any(|s| versions.iter().any(|v| v.version == s.version().version))
        {
            return Err(PolicyError::NoUsableSuites);
        }

        Ok(Self { suites, versions })
    }

    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.suites
    }

    pub fn versions(&self) -> &[&'static SupportedProtocolVersion] {
        &self.versions
    }

    /// Build a server config presenting `bundle`.
    ///
    /// With `verify_clients` set and CA roots in the bundle, every client must
    /// present a certificate chaining to those roots.
    pub fn server_config(
        &self,
        bundle: &CertificateBundle,
        verify_clients: bool,
    ) -> Result<ServerConfig, PolicyError> {
        let mut provider = crypto_provider();
        provider.cipher_suites = self.suites.clone();
        let provider: Arc<CryptoProvider> = Arc::new(provider);

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&self.versions)?;

        let builder = if verify_clients && !bundle.ca_roots().is_empty() {
            let mut roots = RootCertStore::empty();
            for root in bundle.ca_roots() {
                roots.add(root.clone())?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| PolicyError::Verifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder.with_cert_resolver(Arc::new(FixedCert(bundle.certified_key())));
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

/// Presents one certificate for every handshake.
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn is_tls13(suite: &SupportedCipherSuite) -> bool {
    suite.version().version == rustls::ProtocolVersion::TLSv1_3
}

fn suite_matches(suite: &SupportedCipherSuite, name: &str) -> bool {
    let id = u16::from(suite.suite());
    let name = name.trim();
    if let Some(hex) = name.strip_prefix("0x").or_else(|| name.strip_prefix("0X")) {
        return u16::from_str_radix(hex, 16) == Ok(id);
    }
    canonical(name) == canonical(&format!("{:?}", suite.suite()))
}

fn canonical(name: &str) -> String {
    let name = name.to_ascii_uppercase().replace('-', "_");
    let name = match name.strip_prefix("TLS13_").or_else(|| name.strip_prefix("TLS_")) {
        Some(rest) => format!("TLS_{rest}"),
        None => format!("TLS_{name}"),
    };
    if name.contains("CHACHA20_POLY1305") {
        name.trim_end_matches("_SHA256").to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::CipherSuite;

    fn options(suites: &[&str]) -> TlsOptions {
        TlsOptions {
            cipher_suites: suites.iter().map(|s| s.to_string()).collect(),
            ..TlsOptions::default()
        }
    }

    fn ids(policy: &TlsPolicy) -> Vec<CipherSuite> {
        policy.cipher_suites().iter().map(|s| s.suite()).collect()
    }

    #[test]
    fn empty_allow_list_uses_provider_defaults() {
        let policy = TlsPolicy::from_options(&TlsOptions::default()).unwrap();
        assert_eq!(policy.cipher_suites().len(), crypto_provider().cipher_suites.len());
        assert_eq!(policy.versions().len(), 2);
    }

    #[test]
    fn allow_list_restricts_tls12_suites() {
        let policy = TlsPolicy::from_options(&options(&[
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            "0xc02f",
        ]))
        .unwrap();
        let ids = ids(&policy);
        assert!(ids.contains(&CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256));
        assert!(ids.contains(&CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256));
        assert!(!ids.contains(&CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384));
        // TLS 1.3 suites are left alone when none are named.
        assert!(ids.contains(&CipherSuite::TLS13_AES_128_GCM_SHA256));
    }

    #[test]
    fn naming_a_tls13_suite_restricts_tls13() {
        let policy = TlsPolicy::from_options(&options(&["TLS_AES_256_GCM_SHA384"])).unwrap();
        assert_eq!(ids(&policy), vec![CipherSuite::TLS13_AES_256_GCM_SHA384]);
    }

    #[test]
    fn accepts_alternate_spellings() {
        for name in [
            "ecdhe-rsa-with-chacha20-poly1305",
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            "TLS13_CHACHA20_POLY1305_SHA256",
        ] {
            assert!(TlsPolicy::from_options(&options(&[name])).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_unknown_suite() {
        let err = TlsPolicy::from_options(&options(&["TLS_RSA_WITH_RC4_128_SHA"])).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownCipherSuite(_)));
    }

    #[test]
    fn version_bounds() {
        let mut opts = TlsOptions::default();
        opts.min_version = Some(TlsVersion::Tls13);
        let policy = TlsPolicy::from_options(&opts).unwrap();
        assert_eq!(policy.versions().len(), 1);

        opts.max_version = Some(TlsVersion::Tls12);
        assert!(matches!(
            TlsPolicy::from_options(&opts),
            Err(PolicyError::VersionRange { .. })
        ));

        let mut opts = options(&["TLS_AES_128_GCM_SHA256"]);
        opts.max_version = Some(TlsVersion::Tls12);
        assert!(matches!(
            TlsPolicy::from_options(&opts),
            Err(PolicyError::NoUsableSuites)
        ));
    }

    #[test]
    fn builds_server_config_with_alpn() {
        let pair = crate::certs::bundle::tests::self_signed("localhost");
        let bundle = CertificateBundle::from_pem(
            pair.cert_pem.as_bytes(),
            pair.key_pem.as_bytes(),
            Some(pair.cert_pem.as_bytes()),
        )
        .unwrap();
        let policy = TlsPolicy::from_options(&TlsOptions::default()).unwrap();
        let config = policy.server_config(&bundle, true).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }
}
