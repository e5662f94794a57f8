use async_trait::async_trait;
use shared::models::Store;
use shared::util::now_millis;
use uuid::Uuid;

use super::PgRepository;
use crate::db::{RepoError, RepoResult, StoreRepository};

#[derive(sqlx::FromRow)]
struct StoreRow {
    id: Uuid,
    tenant_id: String,
    name: String,
    marketplace: String,
    active: bool,
    last_synced_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl From<StoreRow> for Store {
    fn from(row: StoreRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            marketplace: row.marketplace,
            active: row.active,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const COLUMNS: &str =
    "id, tenant_id, name, marketplace, active, last_synced_at, created_at, updated_at";

#[async_trait]
impl StoreRepository for PgRepository {
    async fn insert_store(&self, store: &Store) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stores (id, tenant_id, name, marketplace, active, last_synced_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(store.id)
        .bind(&store.tenant_id)
        .bind(&store.name)
        .bind(&store.marketplace)
        .bind(store.active)
        .bind(store.last_synced_at)
        .bind(store.created_at)
        .bind(store.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn find_store(&self, tenant_id: &str, store_id: Uuid) -> RepoResult<Option<Store>> {
        let row: Option<StoreRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM stores WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(store_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Store::from))
    }

    async fn list_active_stores(&self) -> RepoResult<Vec<Store>> {
        let rows: Vec<StoreRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM stores WHERE active ORDER BY created_at"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Store::from).collect())
    }

    async fn set_store_active(
        &self,
        tenant_id: &str,
        store_id: Uuid,
        active: bool,
    ) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE stores SET active = $1, updated_at = $2 WHERE tenant_id = $3 AND id = $4",
        )
        .bind(active)
        .bind(now_millis())
        .bind(tenant_id)
        .bind(store_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("store {store_id}")));
        }
        Ok(())
    }

    async fn mark_store_synced(&self, tenant_id: &str, store_id: Uuid, until: i64) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stores
            SET last_synced_at = GREATEST(COALESCE(last_synced_at, $1), $1), updated_at = $2
            WHERE tenant_id = $3 AND id = $4
            "#,
        )
        .bind(until)
        .bind(now_millis())
        .bind(tenant_id)
        .bind(store_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("store {store_id}")));
        }
        Ok(())
    }
}
