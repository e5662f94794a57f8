use async_trait::async_trait;
use shared::models::{CredentialKey, StoredCredential};
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{CredentialRepository, RepoError, RepoResult};

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    tenant_id: String,
    store_id: Option<Uuid>,
    credential_type: String,
    key_name: String,
    encrypted_value: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<CredentialRow> for StoredCredential {
    type Error = RepoError;

    fn try_from(row: CredentialRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            key: CredentialKey {
                tenant_id: row.tenant_id,
                store_id: row.store_id,
                credential_type: parse_enum(&row.credential_type)?,
                key_name: row.key_name,
            },
            encrypted_value: row.encrypted_value,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl CredentialRepository for PgRepository {
    async fn upsert_credential(&self, credential: &StoredCredential) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, tenant_id, store_id, credential_type, key_name, encrypted_value, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, (COALESCE(store_id, '00000000-0000-0000-0000-000000000000'::uuid)), credential_type, key_name)
            DO UPDATE SET encrypted_value = EXCLUDED.encrypted_value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(credential.id)
        .bind(&credential.key.tenant_id)
        .bind(credential.key.store_id)
        .bind(credential.key.credential_type.as_str())
        .bind(&credential.key.key_name)
        .bind(&credential.encrypted_value)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn find_credential(&self, key: &CredentialKey) -> RepoResult<Option<StoredCredential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, store_id, credential_type, key_name, encrypted_value, created_at, updated_at
            FROM credentials
            WHERE tenant_id = $1 AND store_id IS NOT DISTINCT FROM $2
              AND credential_type = $3 AND key_name = $4
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.store_id)
        .bind(key.credential_type.as_str())
        .bind(&key.key_name)
        .fetch_optional(self.pool())
        .await?;
        row.map(StoredCredential::try_from).transpose()
    }

    async fn delete_credential(&self, key: &CredentialKey) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM credentials
            WHERE tenant_id = $1 AND store_id IS NOT DISTINCT FROM $2
              AND credential_type = $3 AND key_name = $4
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.store_id)
        .bind(key.credential_type.as_str())
        .bind(&key.key_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
