//! Transport credentials.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::LinkError;

/// A secret string whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Authentication descriptor presented to the server.
///
/// Deliberately implements neither `Serialize` nor `Display`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Bearer API key sent in the `Authorization` header.
    ApiKey(Secret),
    /// HTTP basic authentication.
    Basic { user: String, secret: Secret },
    /// Client certificate presented during the TLS handshake.
    MutualTls {
        cert_pem: String,
        key_pem: Secret,
        trust_anchor_pem: String,
    },
}

impl Credential {
    /// API key credential.
    #[must_use]
    pub fn api_key(key: impl Into<Secret>) -> Self {
        Self::ApiKey(key.into())
    }

    /// Basic credential.
    #[must_use]
    pub fn basic(user: impl Into<String>, secret: impl Into<Secret>) -> Self {
        Self::Basic {
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Mutual TLS credential from PEM strings.
    #[must_use]
    pub fn mutual_tls(
        cert_pem: impl Into<String>,
        key_pem: impl Into<Secret>,
        trust_anchor_pem: impl Into<String>,
    ) -> Self {
        Self::MutualTls {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
            trust_anchor_pem: trust_anchor_pem.into(),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::Basic { .. } => "basic",
            Self::MutualTls { .. } => "mtls",
        }
    }

    /// Check the credential is well-formed.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` for empty or structurally invalid values.
    pub fn validate(&self) -> Result<(), LinkError> {
        match self {
            Self::ApiKey(key) => {
                let key = key.expose();
                if key.trim().is_empty() {
                    return Err(malformed("API key is empty"));
                }
                if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
                    return Err(malformed("API key contains whitespace or control characters"));
                }
            }
            Self::Basic { user, secret } => {
                if user.is_empty() {
                    return Err(malformed("basic user is empty"));
                }
                if user.contains(':') {
                    return Err(malformed("basic user must not contain ':'"));
                }
                if secret.expose().is_empty() {
                    return Err(malformed("basic secret is empty"));
                }
            }
            Self::MutualTls {
                cert_pem,
                key_pem,
                trust_anchor_pem,
            } => {
                require_pem(cert_pem, "CERTIFICATE", "client certificate")?;
                require_pem(key_pem.expose(), "PRIVATE KEY", "client key")?;
                require_pem(trust_anchor_pem, "CERTIFICATE", "trust anchor")?;
            }
        }
        Ok(())
    }

    /// Value for the `Authorization` header, if this credential uses one.
    #[must_use]
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::ApiKey(key) => Some(format!("Bearer {}", key.expose())),
            Self::Basic { user, secret } => {
                let raw = format!("{user}:{}", secret.expose());
                Some(format!("Basic {}", BASE64.encode(raw)))
            }
            Self::MutualTls { .. } => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("Credential::ApiKey(***)"),
            Self::Basic { user, .. } => {
                write!(f, "Credential::Basic {{ user: {user:?}, secret: *** }}")
            }
            Self::MutualTls { .. } => f.write_str("Credential::MutualTls(***)"),
        }
    }
}

fn malformed(reason: &str) -> LinkError {
    LinkError::Configuration(format!("malformed credential: {reason}"))
}

fn require_pem(pem: &str, label: &str, what: &str) -> Result<(), LinkError> {
    // "PRIVATE KEY" also matches "RSA PRIVATE KEY" and "EC PRIVATE KEY".
    let has_begin = pem
        .lines()
        .any(|line| line.starts_with("-----BEGIN ") && line.contains(label));
    if has_begin {
        Ok(())
    } else {
        Err(malformed(&format!("{what} is not a PEM {label} block")))
    }
}
