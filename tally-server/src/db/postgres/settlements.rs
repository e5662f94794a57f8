use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use shared::models::{SettlementBatch, SettlementCycle, SettlementPeriod};
use sqlx::types::Json;
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{RepoError, RepoResult, SettlementRepository};

#[derive(sqlx::FromRow)]
struct SettlementRow {
    id: Uuid,
    tenant_id: String,
    marketplace: String,
    cycle: String,
    period_start: NaiveDate,
    period_end: NaiveDate,
    status: String,
    gross_sales: Decimal,
    commission: Decimal,
    pg_fee: Decimal,
    shipping_charged: Decimal,
    shipping_settled: Decimal,
    actual_payout: Decimal,
    net_payout: Decimal,
    matched_gross_sales: Decimal,
    matched_commission: Decimal,
    matched_pg_fee: Decimal,
    matched_shipping_settled: Decimal,
    expected_payout: Decimal,
    matched_count: i32,
    unmatched_count: i32,
    unmatched_order_ids: Json<Vec<String>>,
    discrepancy: Option<serde_json::Value>,
    attempt_count: i32,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    active: bool,
    validated_at: Option<i64>,
    posted_at: Option<i64>,
    closed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SettlementRow> for SettlementBatch {
    type Error = RepoError;

    fn try_from(row: SettlementRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            marketplace: row.marketplace,
            cycle: parse_enum(&row.cycle)?,
            period_start: row.period_start,
            period_end: row.period_end,
            status: parse_enum(&row.status)?,
            gross_sales: row.gross_sales,
            commission: row.commission,
            pg_fee: row.pg_fee,
            shipping_charged: row.shipping_charged,
            shipping_settled: row.shipping_settled,
            actual_payout: row.actual_payout,
            net_payout: row.net_payout,
            matched_gross_sales: row.matched_gross_sales,
            matched_commission: row.matched_commission,
            matched_pg_fee: row.matched_pg_fee,
            matched_shipping_settled: row.matched_shipping_settled,
            expected_payout: row.expected_payout,
            matched_count: row.matched_count,
            unmatched_count: row.unmatched_count,
            unmatched_order_ids: row.unmatched_order_ids.0,
            discrepancy: row.discrepancy,
            attempt_count: row.attempt_count,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            active: row.active,
            validated_at: row.validated_at,
            posted_at: row.posted_at,
            closed_at: row.closed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, marketplace, cycle, period_start, period_end, status, \
    gross_sales, commission, pg_fee, shipping_charged, shipping_settled, actual_payout, \
    net_payout, matched_gross_sales, matched_commission, matched_pg_fee, \
    matched_shipping_settled, expected_payout, matched_count, unmatched_count, \
    unmatched_order_ids, discrepancy, attempt_count, next_retry_at, last_error, active, \
    validated_at, posted_at, closed_at, created_at, updated_at";

#[async_trait]
impl SettlementRepository for PgRepository {
    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO settlement_batches ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
              $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32)"
        ))
        .bind(batch.id)
        .bind(&batch.tenant_id)
        .bind(&batch.marketplace)
        .bind(batch.cycle.as_str())
        .bind(batch.period_start)
        .bind(batch.period_end)
        .bind(batch.status.as_str())
        .bind(batch.gross_sales)
        .bind(batch.commission)
        .bind(batch.pg_fee)
        .bind(batch.shipping_charged)
        .bind(batch.shipping_settled)
        .bind(batch.actual_payout)
        .bind(batch.net_payout)
        .bind(batch.matched_gross_sales)
        .bind(batch.matched_commission)
        .bind(batch.matched_pg_fee)
        .bind(batch.matched_shipping_settled)
        .bind(batch.expected_payout)
        .bind(batch.matched_count)
        .bind(batch.unmatched_count)
        .bind(Json(&batch.unmatched_order_ids))
        .bind(&batch.discrepancy)
        .bind(batch.attempt_count)
        .bind(batch.next_retry_at)
        .bind(&batch.last_error)
        .bind(batch.active)
        .bind(batch.validated_at)
        .bind(batch.posted_at)
        .bind(batch.closed_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_batches SET
                status = $1, gross_sales = $2, commission = $3, pg_fee = $4,
                shipping_charged = $5, shipping_settled = $6, actual_payout = $7, net_payout = $8,
                matched_gross_sales = $9, matched_commission = $10, matched_pg_fee = $11,
                matched_shipping_settled = $12, expected_payout = $13, matched_count = $14,
                unmatched_count = $15, unmatched_order_ids = $16, discrepancy = $17,
                attempt_count = $18, next_retry_at = $19, last_error = $20, active = $21,
                validated_at = $22, posted_at = $23, closed_at = $24, updated_at = $25
            WHERE tenant_id = $26 AND id = $27
            "#,
        )
        .bind(batch.status.as_str())
        .bind(batch.gross_sales)
        .bind(batch.commission)
        .bind(batch.pg_fee)
        .bind(batch.shipping_charged)
        .bind(batch.shipping_settled)
        .bind(batch.actual_payout)
        .bind(batch.net_payout)
        .bind(batch.matched_gross_sales)
        .bind(batch.matched_commission)
        .bind(batch.matched_pg_fee)
        .bind(batch.matched_shipping_settled)
        .bind(batch.expected_payout)
        .bind(batch.matched_count)
        .bind(batch.unmatched_count)
        .bind(Json(&batch.unmatched_order_ids))
        .bind(&batch.discrepancy)
        .bind(batch.attempt_count)
        .bind(batch.next_retry_at)
        .bind(&batch.last_error)
        .bind(batch.active)
        .bind(batch.validated_at)
        .bind(batch.posted_at)
        .bind(batch.closed_at)
        .bind(batch.updated_at)
        .bind(&batch.tenant_id)
        .bind(batch.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("settlement batch {}", batch.id)));
        }
        Ok(())
    }

    async fn find_settlement_batch(
        &self,
        tenant_id: &str,
        batch_id: Uuid,
    ) -> RepoResult<Option<SettlementBatch>> {
        let row: Option<SettlementRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM settlement_batches WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(batch_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(SettlementBatch::try_from).transpose()
    }

    async fn find_settlement_batch_by_period(
        &self,
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> RepoResult<Option<SettlementBatch>> {
        let row: Option<SettlementRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM settlement_batches \
             WHERE tenant_id = $1 AND marketplace = $2 AND cycle = $3 \
               AND period_start = $4 AND period_end = $5"
        ))
        .bind(tenant_id)
        .bind(marketplace)
        .bind(cycle.as_str())
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(self.pool())
        .await?;
        row.map(SettlementBatch::try_from).transpose()
    }

    async fn list_due_settlement_batches(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<SettlementBatch>> {
        let rows: Vec<SettlementRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM settlement_batches \
             WHERE tenant_id = $1 AND active AND status IN ('FAILED', 'POSTING_READY') \
               AND next_retry_at IS NOT NULL AND next_retry_at <= $2 \
             ORDER BY next_retry_at LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(SettlementBatch::try_from).collect()
    }
}
