//! Credential vault
//!
//! Secrets are encrypted with the process [`MasterKey`] before they reach the
//! repository. Decrypted values only leave the vault inside [`Credentials`],
//! whose strings are wiped on drop.

use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{CredentialKey, CredentialType, StoredCredential};
use shared::util::now_millis;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit_log;
use crate::crypto::{CryptoError, MasterKey};
use crate::db::CredentialRepository;

/// Decrypted secrets for one adapter call, keyed by key name
#[derive(Default, Clone)]
pub struct Credentials {
    values: BTreeMap<String, Zeroizing<String>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key_name.into(), Zeroizing::new(value.into()));
    }

    pub fn with(mut self, key_name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key_name, value);
        self
    }

    pub fn get(&self, key_name: &str) -> Option<&str> {
        self.values.get(key_name).map(|v| v.as_str())
    }

    /// Fails with `CredentialNotFound` when the key is absent
    pub fn require(&self, key_name: &str) -> AppResult<&str> {
        self.get(key_name).ok_or_else(|| {
            AppError::with_message(
                ErrorCode::CredentialNotFound,
                format!("credential '{key_name}' not loaded"),
            )
            .with_detail("key_name", key_name)
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        let code = match err {
            CryptoError::Encrypt => ErrorCode::CredentialEncryptFailed,
            _ => ErrorCode::CredentialDecryptFailed,
        };
        AppError::with_message(code, err.to_string())
    }
}

pub struct CredentialVault {
    repo: Arc<dyn CredentialRepository>,
    key: MasterKey,
}

impl CredentialVault {
    pub fn new(repo: Arc<dyn CredentialRepository>, key: MasterKey) -> Self {
        Self { repo, key }
    }

    /// Encrypt and store, replacing any previous value for the same key
    pub async fn put(&self, key: &CredentialKey, plaintext: &str) -> AppResult<()> {
        let encrypted_value = self.key.encrypt_string(plaintext)?;
        let now = now_millis();
        let record = StoredCredential {
            id: Uuid::new_v4(),
            key: key.clone(),
            encrypted_value,
            created_at: now,
            updated_at: now,
        };
        self.repo.upsert_credential(&record).await?;

        audit_log!(
            key.tenant_id.as_str(),
            "credential_put",
            format!("{}:{}", key.credential_type, key.key_name).as_str()
        );
        Ok(())
    }

    /// Exact lookup; a store-scoped key falls back to the tenant-wide secret
    pub async fn get(&self, key: &CredentialKey) -> AppResult<Zeroizing<String>> {
        match self.find(key).await? {
            Some(value) => Ok(value),
            None => Err(AppError::with_message(
                ErrorCode::CredentialNotFound,
                format!("credential '{}' not found", key.key_name),
            )
            .with_detail("credential_type", key.credential_type.as_str())
            .with_detail("key_name", key.key_name.as_str())),
        }
    }

    pub async fn delete(&self, key: &CredentialKey) -> AppResult<bool> {
        let removed = self.repo.delete_credential(key).await?;
        if removed {
            audit_log!(
                key.tenant_id.as_str(),
                "credential_delete",
                format!("{}:{}", key.credential_type, key.key_name).as_str()
            );
        }
        Ok(removed)
    }

    /// Load every key in `key_names`. Missing keys are reported together.
    pub async fn load(
        &self,
        tenant_id: &str,
        store_id: Option<Uuid>,
        credential_type: CredentialType,
        key_names: &[&str],
    ) -> AppResult<Credentials> {
        let mut credentials = Credentials::new();
        let mut missing = Vec::new();
        for key_name in key_names {
            let key = CredentialKey::new(tenant_id, store_id, credential_type, key_name);
            match self.find(&key).await? {
                Some(value) => {
                    credentials.values.insert((*key_name).to_string(), value);
                }
                None => missing.push((*key_name).to_string()),
            }
        }
        if !missing.is_empty() {
            tracing::warn!(
                tenant_id = %tenant_id,
                credential_type = %credential_type,
                missing = ?missing,
                "Credentials missing"
            );
            return Err(AppError::with_message(
                ErrorCode::CredentialNotFound,
                format!("missing {credential_type} credentials: {}", missing.join(", ")),
            )
            .with_detail("missing", missing));
        }
        Ok(credentials)
    }

    async fn find(&self, key: &CredentialKey) -> AppResult<Option<Zeroizing<String>>> {
        let mut stored = self.repo.find_credential(key).await?;
        if stored.is_none() && key.store_id.is_some() {
            stored = self.repo.find_credential(&key.tenant_wide()).await?;
        }
        match stored {
            Some(record) => {
                let plaintext = self.key.decrypt_string(&record.encrypted_value)?;
                Ok(Some(Zeroizing::new(plaintext)))
            }
            None => Ok(None),
        }
    }
}
