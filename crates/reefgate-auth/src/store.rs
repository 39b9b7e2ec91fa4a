//! Credential storage
//!
//! The pipeline consumes credentials through the [`CredentialStore`] trait.
//! In production this is backed by the metadata service; the in-memory
//! implementation here serves embedded deployments and tests.

use crate::credentials::Credential;
use async_trait::async_trait;
use parking_lot::RwLock;
use reefgate_common::ApiError;
use std::collections::HashMap;

/// Resolves access keys to credential records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the credential for an access key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAccessKeyId` when the access key does not exist or
    /// the credential has expired.
    async fn lookup(&self, access_key: &str) -> Result<Credential, ApiError>;

    /// Whether the access key is the process root credential.
    fn is_root(&self, access_key: &str) -> bool;
}

/// In-memory credential store
pub struct MemoryCredentialStore {
    root: Credential,
    creds: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new(root: Credential) -> Self {
        Self {
            root,
            creds: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, cred: Credential) {
        self.creds.write().insert(cred.access_key.clone(), cred);
    }

    pub fn remove(&self, access_key: &str) {
        self.creds.write().remove(access_key);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(&self, access_key: &str) -> Result<Credential, ApiError> {
        if access_key == self.root.access_key && !self.root.access_key.is_empty() {
            return Ok(self.root.clone());
        }
        let cred = self
            .creds
            .read()
            .get(access_key)
            .cloned()
            .ok_or(ApiError::InvalidAccessKeyId)?;
        if cred.is_expired() {
            return Err(ApiError::InvalidAccessKeyId);
        }
        Ok(cred)
    }

    fn is_root(&self, access_key: &str) -> bool {
        !self.root.access_key.is_empty() && access_key == self.root.access_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_lookup_root() {
        let store = MemoryCredentialStore::new(Credential::new("AKIAROOT", "rootsecret"));
        let cred = store.lookup("AKIAROOT").await.unwrap();
        assert_eq!(cred.secret_key, "rootsecret");
        assert!(store.is_root("AKIAROOT"));
        assert!(!store.is_root("AKIAOTHER"));
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let store = MemoryCredentialStore::new(Credential::new("AKIAROOT", "rootsecret"));
        assert_eq!(
            store.lookup("AKIANOPE").await.unwrap_err(),
            ApiError::InvalidAccessKeyId
        );
    }

    #[tokio::test]
    async fn test_lookup_expired_temp() {
        let store = MemoryCredentialStore::new(Credential::new("AKIAROOT", "rootsecret"));
        store.insert(Credential::temporary(
            "AKIATEMP",
            "secret",
            "token",
            Utc::now() - Duration::minutes(1),
        ));
        assert_eq!(
            store.lookup("AKIATEMP").await.unwrap_err(),
            ApiError::InvalidAccessKeyId
        );
    }
}
