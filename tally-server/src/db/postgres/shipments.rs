use async_trait::async_trait;
use shared::models::{Shipment, ShipmentStatus};
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{RepoError, RepoResult, ShipmentRepository};

#[derive(sqlx::FromRow)]
struct ShipmentRow {
    id: Uuid,
    tenant_id: String,
    order_id: Uuid,
    store_id: Uuid,
    marketplace: String,
    marketplace_order_id: String,
    carrier_code: Option<String>,
    tracking_number: Option<String>,
    status: String,
    market_push_status: String,
    retry_count: i32,
    last_attempted_at: Option<i64>,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    active: bool,
    pushed_at: Option<i64>,
    shipped_at: Option<i64>,
    delivered_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = RepoError;

    fn try_from(row: ShipmentRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            order_id: row.order_id,
            store_id: row.store_id,
            marketplace: row.marketplace,
            marketplace_order_id: row.marketplace_order_id,
            carrier_code: row.carrier_code,
            tracking_number: row.tracking_number,
            status: parse_enum(&row.status)?,
            market_push_status: parse_enum(&row.market_push_status)?,
            retry_count: row.retry_count,
            last_attempted_at: row.last_attempted_at,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            active: row.active,
            pushed_at: row.pushed_at,
            shipped_at: row.shipped_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, order_id, store_id, marketplace, marketplace_order_id, \
    carrier_code, tracking_number, status, market_push_status, retry_count, last_attempted_at, \
    next_retry_at, last_error, active, pushed_at, shipped_at, delivered_at, created_at, updated_at";

fn collect(rows: Vec<ShipmentRow>) -> RepoResult<Vec<Shipment>> {
    rows.into_iter().map(Shipment::try_from).collect()
}

#[async_trait]
impl ShipmentRepository for PgRepository {
    async fn insert_shipment(&self, shipment: &Shipment) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO shipments ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(shipment.id)
        .bind(&shipment.tenant_id)
        .bind(shipment.order_id)
        .bind(shipment.store_id)
        .bind(&shipment.marketplace)
        .bind(&shipment.marketplace_order_id)
        .bind(&shipment.carrier_code)
        .bind(&shipment.tracking_number)
        .bind(shipment.status.as_str())
        .bind(shipment.market_push_status.as_str())
        .bind(shipment.retry_count)
        .bind(shipment.last_attempted_at)
        .bind(shipment.next_retry_at)
        .bind(&shipment.last_error)
        .bind(shipment.active)
        .bind(shipment.pushed_at)
        .bind(shipment.shipped_at)
        .bind(shipment.delivered_at)
        .bind(shipment.created_at)
        .bind(shipment.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_shipment(&self, shipment: &Shipment) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE shipments SET
                carrier_code = $1, tracking_number = $2, status = $3, market_push_status = $4,
                retry_count = $5, last_attempted_at = $6, next_retry_at = $7, last_error = $8,
                active = $9, pushed_at = $10, shipped_at = $11, delivered_at = $12, updated_at = $13
            WHERE tenant_id = $14 AND id = $15
            "#,
        )
        .bind(&shipment.carrier_code)
        .bind(&shipment.tracking_number)
        .bind(shipment.status.as_str())
        .bind(shipment.market_push_status.as_str())
        .bind(shipment.retry_count)
        .bind(shipment.last_attempted_at)
        .bind(shipment.next_retry_at)
        .bind(&shipment.last_error)
        .bind(shipment.active)
        .bind(shipment.pushed_at)
        .bind(shipment.shipped_at)
        .bind(shipment.delivered_at)
        .bind(shipment.updated_at)
        .bind(&shipment.tenant_id)
        .bind(shipment.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("shipment {}", shipment.id)));
        }
        Ok(())
    }

    async fn find_shipment(
        &self,
        tenant_id: &str,
        shipment_id: Uuid,
    ) -> RepoResult<Option<Shipment>> {
        let row: Option<ShipmentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM shipments WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(shipment_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Shipment::try_from).transpose()
    }

    async fn find_shipment_by_order(
        &self,
        tenant_id: &str,
        order_id: Uuid,
    ) -> RepoResult<Option<Shipment>> {
        let row: Option<ShipmentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM shipments WHERE tenant_id = $1 AND order_id = $2"
        ))
        .bind(tenant_id)
        .bind(order_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Shipment::try_from).transpose()
    }

    async fn list_shipments_by_status(
        &self,
        tenant_id: &str,
        status: ShipmentStatus,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>> {
        let rows: Vec<ShipmentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM shipments WHERE tenant_id = $1 AND status = $2 AND active \
             ORDER BY updated_at LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }

    async fn list_due_shipments(
        &self,
        tenant_id: &str,
        now: i64,
        max_retries: i32,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>> {
        let rows: Vec<ShipmentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM shipments \
             WHERE tenant_id = $1 AND active AND status = 'FAILED' AND market_push_status = 'FAILED' \
               AND retry_count < $2 AND next_retry_at IS NOT NULL AND next_retry_at <= $3 \
             ORDER BY next_retry_at LIMIT $4"
        ))
        .bind(tenant_id)
        .bind(max_retries)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }

    async fn list_shipments_for_review(
        &self,
        tenant_id: &str,
        max_retries: i32,
    ) -> RepoResult<Vec<Shipment>> {
        let rows: Vec<ShipmentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM shipments \
             WHERE tenant_id = $1 AND active AND status = 'FAILED' \
               AND (retry_count >= $2 OR next_retry_at IS NULL) \
             ORDER BY last_attempted_at"
        ))
        .bind(tenant_id)
        .bind(max_retries)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }
}
