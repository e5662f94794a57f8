//! Encrypted credential records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialType {
    Marketplace,
    Erp,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marketplace => "MARKETPLACE",
            Self::Erp => "ERP",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKETPLACE" => Ok(Self::Marketplace),
            "ERP" => Ok(Self::Erp),
            _ => Err(ParseEnumError::new("credential type", s)),
        }
    }
}

/// Lookup key. `store_id = None` addresses a tenant-wide secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialKey {
    pub tenant_id: String,
    pub store_id: Option<Uuid>,
    pub credential_type: CredentialType,
    pub key_name: String,
}

impl CredentialKey {
    pub fn new(
        tenant_id: &str,
        store_id: Option<Uuid>,
        credential_type: CredentialType,
        key_name: &str,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            store_id,
            credential_type,
            key_name: key_name.to_string(),
        }
    }

    pub fn tenant_wide(&self) -> Self {
        Self {
            store_id: None,
            ..self.clone()
        }
    }
}

/// Persisted form; `encrypted_value` is base64(nonce || ciphertext)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: Uuid,
    pub key: CredentialKey,
    pub encrypted_value: String,
    pub created_at: i64,
    pub updated_at: i64,
}
