use async_trait::async_trait;
use shared::models::{MappingScope, MappingStatus, ProductMapping};
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{MappingRepository, RepoError, RepoResult};

#[derive(sqlx::FromRow)]
struct MappingRow {
    id: Uuid,
    tenant_id: String,
    store_id: Option<Uuid>,
    marketplace: String,
    marketplace_product_id: String,
    marketplace_sku: String,
    erp_item_code: Option<String>,
    erp_item_name: Option<String>,
    erp_warehouse_code: Option<String>,
    status: String,
    mapping_type: String,
    confidence: f64,
    active: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<MappingRow> for ProductMapping {
    type Error = RepoError;

    fn try_from(row: MappingRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            store_id: row.store_id,
            marketplace: row.marketplace,
            marketplace_product_id: row.marketplace_product_id,
            marketplace_sku: row.marketplace_sku,
            erp_item_code: row.erp_item_code,
            erp_item_name: row.erp_item_name,
            erp_warehouse_code: row.erp_warehouse_code,
            status: parse_enum(&row.status)?,
            mapping_type: parse_enum(&row.mapping_type)?,
            confidence: row.confidence,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, store_id, marketplace, marketplace_product_id, \
    marketplace_sku, erp_item_code, erp_item_name, erp_warehouse_code, status, mapping_type, \
    confidence, active, created_at, updated_at";

#[async_trait]
impl MappingRepository for PgRepository {
    async fn find_active_mapping(
        &self,
        scope: &MappingScope,
    ) -> RepoResult<Option<ProductMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM product_mappings \
             WHERE tenant_id = $1 AND store_id IS NOT DISTINCT FROM $2 AND marketplace = $3 \
               AND marketplace_product_id = $4 AND marketplace_sku = $5 AND active"
        ))
        .bind(&scope.tenant_id)
        .bind(scope.store_id)
        .bind(&scope.marketplace)
        .bind(&scope.product_id)
        .bind(&scope.sku)
        .fetch_optional(self.pool())
        .await?;
        row.map(ProductMapping::try_from).transpose()
    }

    async fn find_mapping(
        &self,
        tenant_id: &str,
        mapping_id: Uuid,
    ) -> RepoResult<Option<ProductMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM product_mappings WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(mapping_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(ProductMapping::try_from).transpose()
    }

    async fn replace_active_mapping(&self, mapping: &ProductMapping) -> RepoResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE product_mappings SET active = FALSE, updated_at = $1
            WHERE tenant_id = $2 AND store_id IS NOT DISTINCT FROM $3 AND marketplace = $4
              AND marketplace_product_id = $5 AND marketplace_sku = $6 AND active AND id <> $7
            "#,
        )
        .bind(mapping.updated_at)
        .bind(&mapping.tenant_id)
        .bind(mapping.store_id)
        .bind(&mapping.marketplace)
        .bind(&mapping.marketplace_product_id)
        .bind(&mapping.marketplace_sku)
        .bind(mapping.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO product_mappings ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (id) DO UPDATE SET \
                erp_item_code = EXCLUDED.erp_item_code, erp_item_name = EXCLUDED.erp_item_name, \
                erp_warehouse_code = EXCLUDED.erp_warehouse_code, status = EXCLUDED.status, \
                mapping_type = EXCLUDED.mapping_type, confidence = EXCLUDED.confidence, \
                active = EXCLUDED.active, updated_at = EXCLUDED.updated_at"
        ))
        .bind(mapping.id)
        .bind(&mapping.tenant_id)
        .bind(mapping.store_id)
        .bind(&mapping.marketplace)
        .bind(&mapping.marketplace_product_id)
        .bind(&mapping.marketplace_sku)
        .bind(&mapping.erp_item_code)
        .bind(&mapping.erp_item_name)
        .bind(&mapping.erp_warehouse_code)
        .bind(mapping.status.as_str())
        .bind(mapping.mapping_type.as_str())
        .bind(mapping.confidence)
        .bind(mapping.active)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_mapping(&self, mapping: &ProductMapping) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE product_mappings SET
                erp_item_code = $1, erp_item_name = $2, erp_warehouse_code = $3, status = $4,
                mapping_type = $5, confidence = $6, active = $7, updated_at = $8
            WHERE tenant_id = $9 AND id = $10
            "#,
        )
        .bind(&mapping.erp_item_code)
        .bind(&mapping.erp_item_name)
        .bind(&mapping.erp_warehouse_code)
        .bind(mapping.status.as_str())
        .bind(mapping.mapping_type.as_str())
        .bind(mapping.confidence)
        .bind(mapping.active)
        .bind(mapping.updated_at)
        .bind(&mapping.tenant_id)
        .bind(mapping.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("mapping {}", mapping.id)));
        }
        Ok(())
    }

    async fn list_mappings(
        &self,
        tenant_id: &str,
        status: Option<MappingStatus>,
    ) -> RepoResult<Vec<ProductMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM product_mappings \
             WHERE tenant_id = $1 AND active AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY marketplace_product_id, marketplace_sku"
        ))
        .bind(tenant_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ProductMapping::try_from).collect()
    }
}
