//! TLS material for mutual TLS credentials.

use std::sync::Arc;

use collector_link_core::{Credential, LinkError};
use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
};

fn tls_error(what: &str, err: impl std::fmt::Display) -> LinkError {
    LinkError::Configuration(format!("invalid {what}: {err}"))
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>, LinkError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(what, e))?;
    if certs.is_empty() {
        return Err(tls_error(what, "no certificate found"));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, LinkError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| tls_error("client key", e))?
        .ok_or_else(|| tls_error("client key", "no private key found"))
}

/// Build a rustls client config presenting the client certificate.
///
/// Returns `Ok(None)` for credentials that authenticate with a header.
///
/// # Errors
/// Returns `LinkError::Configuration` if the PEM material cannot be parsed.
pub fn client_config(credential: &Credential) -> Result<Option<Arc<ClientConfig>>, LinkError> {
    let Credential::MutualTls {
        cert_pem,
        key_pem,
        trust_anchor_pem,
    } = credential
    else {
        return Ok(None);
    };

    let mut roots = RootCertStore::empty();
    for cert in parse_certs(trust_anchor_pem, "trust anchor")? {
        roots.add(cert).map_err(|e| tls_error("trust anchor", e))?;
    }
    let chain = parse_certs(cert_pem, "client certificate")?;
    let key = parse_key(key_pem.expose())?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("TLS protocol configuration", e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| tls_error("client certificate", e))?;
    Ok(Some(Arc::new(config)))
}

/// Apply a credential's TLS material to a reqwest builder.
///
/// # Errors
/// Returns `LinkError::Configuration` if the PEM material cannot be parsed.
pub fn configure_reqwest(
    builder: reqwest::ClientBuilder,
    credential: &Credential,
) -> Result<reqwest::ClientBuilder, LinkError> {
    match credential {
        Credential::ApiKey(_) | Credential::Basic { .. } => Ok(builder),
        Credential::MutualTls {
            cert_pem,
            key_pem,
            trust_anchor_pem,
        } => {
            let mut identity_pem = Vec::with_capacity(cert_pem.len() + key_pem.expose().len() + 1);
            identity_pem.extend_from_slice(key_pem.expose().as_bytes());
            identity_pem.push(b'\n');
            identity_pem.extend_from_slice(cert_pem.as_bytes());

            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| tls_error("client identity", e))?;
            let anchor = reqwest::Certificate::from_pem(trust_anchor_pem.as_bytes())
                .map_err(|e| tls_error("trust anchor", e))?;

            Ok(builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(anchor)
                .identity(identity))
        }
    }
}

fn is_rejecting(tls: &rustls::Error) -> bool {
    matches!(
        tls,
        rustls::Error::InvalidCertificate(_)
            | rustls::Error::AlertReceived(_)
            | rustls::Error::NoCertificatesPresented
    )
}

/// Whether an error chain contains a TLS certificate rejection.
///
/// `io::Error::source` skips the wrapped error, so each `io::Error` in the
/// chain is also unwrapped through `get_ref`.
#[must_use]
pub fn is_certificate_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return is_rejecting(tls);
        }
        if let Some(inner) = e
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
        {
            let inner: &(dyn std::error::Error + 'static) = inner;
            if is_certificate_rejection(inner) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
