//! JWT rule configuration.
//!
//! The rule is supplied as a JSON document:
//!
//! ```json
//! {"issuer": "https://issuer.example", "jwks_uri": "https://issuer.example/jwks", "audiences": ["aud1"]}
//! ```
//!
//! Only the shape of the document is checked here. Token verification against
//! the key set belongs to the authenticator's consumer.

use serde_json::{Map, Value};
use thiserror::Error;

/// Structural problems with a JWT rule document.
#[derive(Debug, Error)]
pub enum JwtRuleError {
    #[error("not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `audiences[{0}]` must not be empty")]
    EmptyAudience(usize),
}

/// A validated JWT rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtRule {
    pub issuer: String,
    pub jwks_uri: String,
    pub audiences: Vec<String>,
}

impl JwtRule {
    /// Parse and structurally validate a rule document.
    pub fn parse(json: &str) -> Result<Self, JwtRuleError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(fields) = value else {
            return Err(JwtRuleError::NotAnObject);
        };

        let issuer = required_string(&fields, "issuer")?;
        let jwks_uri = required_string(&fields, "jwks_uri")?;
        let audiences = match fields.get("audiences") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::String(s) if s.is_empty() => Err(JwtRuleError::EmptyAudience(i)),
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(JwtRuleError::InvalidType {
                        field: "audiences",
                        expected: "an array of strings",
                    }),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(JwtRuleError::InvalidType {
                    field: "audiences",
                    expected: "an array of strings",
                })
            }
        };

        Ok(Self {
            issuer,
            jwks_uri,
            audiences,
        })
    }
}

fn required_string(
    fields: &Map<String, Value>,
    field: &'static str,
) -> Result<String, JwtRuleError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(JwtRuleError::Missing(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(JwtRuleError::InvalidType {
            field,
            expected: "a string",
        }),
    }
}

/// Authenticator configuration for the secure gRPC path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtAuthenticator {
    pub issuer: String,
    pub jwks_uri: String,
    /// Accepted audiences. Falls back to the trust domain when the rule names none.
    pub audiences: Vec<String>,
    pub trust_domain: String,
}

impl JwtAuthenticator {
    pub fn new(rule: JwtRule, trust_domain: &str) -> Self {
        let audiences = if rule.audiences.is_empty() {
            vec![trust_domain.to_string()]
        } else {
            rule.audiences
        };
        Self {
            issuer: rule.issuer,
            jwks_uri: rule.jwks_uri,
            audiences,
            trust_domain: trust_domain.to_string(),
        }
    }

    pub fn accepts_audience(&self, audience: &str) -> bool {
        self.audiences.iter().any(|a| a == audience)
    }
}

/// Build the authenticator from an optional rule string.
///
/// An unset or empty rule yields `None`; a malformed rule is an error.
pub fn init_oidc(
    rule: Option<&str>,
    trust_domain: &str,
) -> Result<Option<JwtAuthenticator>, JwtRuleError> {
    match rule.filter(|r| !r.trim().is_empty()) {
        None => Ok(None),
        Some(rule) => {
            let rule = JwtRule::parse(rule)?;
            tracing::info!(
                issuer = %rule.issuer,
                jwks_uri = %rule.jwks_uri,
                audiences = ?rule.audiences,
                "JWT authenticator configured"
            );
            Ok(Some(JwtAuthenticator::new(rule, trust_domain)))
        }
    }
}
