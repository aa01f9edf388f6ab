//! In-memory credential store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use collector_link_core::{Credential, CredentialStore, StoreError};

/// In-memory credential store.
///
/// Useful for tests and embedding where the host already holds the secret.
/// Nothing is persisted.
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store holding one credential.
    #[must_use]
    pub fn with_credential(key: impl Into<String>, credential: Credential) -> Self {
        let store = Self::new();
        if let Ok(mut credentials) = store.credentials.write() {
            credentials.insert(key.into(), credential);
        }
        store
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, credential: Credential) -> Result<(), StoreError> {
        self.credentials
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(key.to_string(), credential);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.credentials
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use collector_link_core::{LinkError, traits::require_credential};

    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryCredentialStore::new();
        assert!(store.get("prod").await.unwrap().is_none());

        store.put("prod", Credential::api_key("k1")).await.unwrap();
        assert_eq!(store.get("prod").await.unwrap(), Some(Credential::api_key("k1")));

        store.put("prod", Credential::api_key("k2")).await.unwrap();
        assert_eq!(store.get("prod").await.unwrap(), Some(Credential::api_key("k2")));

        store.delete("prod").await.unwrap();
        store.delete("prod").await.unwrap();
        assert!(store.get("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_is_fatal() {
        let store = MemoryCredentialStore::new();
        let err = require_credential(&store, "prod").await.unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_stored_malformed_credential_is_rejected() {
        let store = MemoryCredentialStore::with_credential("prod", Credential::api_key(""));
        let err = require_credential(&store, "prod").await.unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }
}
