//! Collaborator boundaries.

use async_trait::async_trait;
use thiserror::Error;

use crate::{credential::Credential, error::LinkError};

/// Credential store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Credential not found: {0}")]
    NotFound(String),
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
    #[error("Credential store error: {0}")]
    Internal(String),
}

impl From<StoreError> for LinkError {
    // Credential lookup failures are fatal and never retried.
    fn from(err: StoreError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Secure secret store holding transport credentials.
///
/// The storage mechanism and persistence format belong to the implementor.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch a credential by key.
    async fn get(&self, key: &str) -> Result<Option<Credential>, StoreError>;

    /// Store or replace a credential.
    async fn put(&self, key: &str, credential: Credential) -> Result<(), StoreError>;

    /// Remove a credential. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Fetch a credential, treating absence as fatal.
///
/// # Errors
/// Returns `LinkError::Configuration` if the store fails or the key is missing.
pub async fn require_credential(
    store: &dyn CredentialStore,
    key: &str,
) -> Result<Credential, LinkError> {
    let credential = store
        .get(key)
        .await?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    credential.validate()?;
    Ok(credential)
}
