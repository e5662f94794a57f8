use async_trait::async_trait;
use rust_decimal::Decimal;
use shared::models::{MarketOrder, OrderItem, OrderPostingStatus};
use shared::util::now_millis;
use sqlx::types::Json;
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{OrderRepository, OrderSettlement, RepoError, RepoResult, UpsertOutcome};

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    tenant_id: String,
    store_id: Uuid,
    marketplace: String,
    marketplace_order_id: String,
    ordered_at: i64,
    buyer_name: Option<String>,
    shipping_fee: Decimal,
    total_amount: Decimal,
    items: Json<Vec<OrderItem>>,
    posting_status: String,
    posting_error: Option<String>,
    commission: Option<Decimal>,
    pg_fee: Option<Decimal>,
    shipping_settled: Option<Decimal>,
    settlement_batch_id: Option<Uuid>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for MarketOrder {
    type Error = RepoError;

    fn try_from(row: OrderRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            store_id: row.store_id,
            marketplace: row.marketplace,
            marketplace_order_id: row.marketplace_order_id,
            ordered_at: row.ordered_at,
            buyer_name: row.buyer_name,
            shipping_fee: row.shipping_fee,
            total_amount: row.total_amount,
            items: row.items.0,
            posting_status: parse_enum(&row.posting_status)?,
            posting_error: row.posting_error,
            commission: row.commission,
            pg_fee: row.pg_fee,
            shipping_settled: row.shipping_settled,
            settlement_batch_id: row.settlement_batch_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, store_id, marketplace, marketplace_order_id, ordered_at, \
    buyer_name, shipping_fee, total_amount, items, posting_status, posting_error, commission, \
    pg_fee, shipping_settled, settlement_batch_id, created_at, updated_at";

#[async_trait]
impl OrderRepository for PgRepository {
    async fn upsert_order(&self, order: &MarketOrder) -> RepoResult<UpsertOutcome> {
        // xmax = 0 only for rows created by this statement
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO market_orders (
                id, tenant_id, store_id, marketplace, marketplace_order_id, ordered_at,
                buyer_name, shipping_fee, total_amount, items, posting_status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (tenant_id, store_id, marketplace, marketplace_order_id) DO UPDATE SET
                ordered_at = EXCLUDED.ordered_at,
                buyer_name = EXCLUDED.buyer_name,
                shipping_fee = EXCLUDED.shipping_fee,
                total_amount = EXCLUDED.total_amount,
                items = EXCLUDED.items,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(order.id)
        .bind(&order.tenant_id)
        .bind(order.store_id)
        .bind(&order.marketplace)
        .bind(&order.marketplace_order_id)
        .bind(order.ordered_at)
        .bind(&order.buyer_name)
        .bind(order.shipping_fee)
        .bind(order.total_amount)
        .bind(Json(&order.items))
        .bind(order.posting_status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(self.pool())
        .await?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn find_order(&self, tenant_id: &str, order_id: Uuid) -> RepoResult<Option<MarketOrder>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM market_orders WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(order_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(MarketOrder::try_from).transpose()
    }

    async fn find_order_by_marketplace_id(
        &self,
        tenant_id: &str,
        marketplace: &str,
        marketplace_order_id: &str,
    ) -> RepoResult<Option<MarketOrder>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM market_orders \
             WHERE tenant_id = $1 AND marketplace = $2 AND marketplace_order_id = $3 \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(marketplace)
        .bind(marketplace_order_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(MarketOrder::try_from).transpose()
    }

    async fn update_order_posting(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        status: OrderPostingStatus,
        error: Option<&str>,
    ) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE market_orders SET posting_status = $1, posting_error = $2, updated_at = $3
            WHERE tenant_id = $4 AND id = $5
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_millis())
        .bind(tenant_id)
        .bind(order_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }

    async fn update_order_settlement(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        settlement: OrderSettlement,
    ) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE market_orders SET
                commission = $1, pg_fee = $2, shipping_settled = $3, settlement_batch_id = $4,
                updated_at = $5
            WHERE tenant_id = $6 AND id = $7
            "#,
        )
        .bind(settlement.commission)
        .bind(settlement.pg_fee)
        .bind(settlement.shipping_settled)
        .bind(settlement.batch_id)
        .bind(now_millis())
        .bind(tenant_id)
        .bind(order_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }

    async fn list_orders_for_posting(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> RepoResult<Vec<MarketOrder>> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM market_orders \
             WHERE tenant_id = $1 AND posting_status IN ('NOT_POSTED', 'PENDING_MAPPING') \
             ORDER BY ordered_at LIMIT $2"
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MarketOrder::try_from).collect()
    }
}
