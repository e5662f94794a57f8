use async_trait::async_trait;
use rust_decimal::Decimal;
use shared::models::{Posting, PostingDocument, PostingStatus};
use sqlx::types::Json;
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{PostingRepository, RepoError, RepoResult};

#[derive(sqlx::FromRow)]
struct PostingRow {
    id: Uuid,
    tenant_id: String,
    idempotency_key: String,
    posting_type: String,
    source: String,
    reference_id: Uuid,
    status: String,
    document: Option<Json<PostingDocument>>,
    supply_amount: Decimal,
    vat_amount: Decimal,
    total_amount: Decimal,
    erp_reference: Option<String>,
    retry_count: i32,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    last_error_code: Option<i32>,
    active: bool,
    requested_at: Option<i64>,
    posted_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<PostingRow> for Posting {
    type Error = RepoError;

    fn try_from(row: PostingRow) -> RepoResult<Self> {
        let last_error_code = row
            .last_error_code
            .map(u16::try_from)
            .transpose()
            .map_err(|e| RepoError::Database(format!("last_error_code: {e}")))?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            idempotency_key: row.idempotency_key,
            posting_type: parse_enum(&row.posting_type)?,
            source: parse_enum(&row.source)?,
            reference_id: row.reference_id,
            status: parse_enum(&row.status)?,
            document: row.document.map(|d| d.0),
            supply_amount: row.supply_amount,
            vat_amount: row.vat_amount,
            total_amount: row.total_amount,
            erp_reference: row.erp_reference,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            last_error_code,
            active: row.active,
            requested_at: row.requested_at,
            posted_at: row.posted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, idempotency_key, posting_type, source, reference_id, \
    status, document, supply_amount, vat_amount, total_amount, erp_reference, retry_count, \
    next_retry_at, last_error, last_error_code, active, requested_at, posted_at, created_at, \
    updated_at";

fn collect(rows: Vec<PostingRow>) -> RepoResult<Vec<Posting>> {
    rows.into_iter().map(Posting::try_from).collect()
}

#[async_trait]
impl PostingRepository for PgRepository {
    async fn insert_posting(&self, posting: &Posting) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO postings ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
        ))
        .bind(posting.id)
        .bind(&posting.tenant_id)
        .bind(&posting.idempotency_key)
        .bind(posting.posting_type.as_str())
        .bind(posting.source.as_str())
        .bind(posting.reference_id)
        .bind(posting.status.as_str())
        .bind(posting.document.as_ref().map(Json))
        .bind(posting.supply_amount)
        .bind(posting.vat_amount)
        .bind(posting.total_amount)
        .bind(&posting.erp_reference)
        .bind(posting.retry_count)
        .bind(posting.next_retry_at)
        .bind(&posting.last_error)
        .bind(posting.last_error_code.map(i32::from))
        .bind(posting.active)
        .bind(posting.requested_at)
        .bind(posting.posted_at)
        .bind(posting.created_at)
        .bind(posting.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_posting(&self, posting: &Posting) -> RepoResult<()> {
        if self.write_posting(posting, None).await? == 0 {
            return Err(RepoError::NotFound(format!("posting {}", posting.id)));
        }
        Ok(())
    }

    async fn update_posting_if_status(
        &self,
        posting: &Posting,
        expected: PostingStatus,
    ) -> RepoResult<bool> {
        Ok(self.write_posting(posting, Some(expected)).await? > 0)
    }

    async fn find_posting(&self, tenant_id: &str, posting_id: Uuid) -> RepoResult<Option<Posting>> {
        let row: Option<PostingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM postings WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(posting_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Posting::try_from).transpose()
    }

    async fn find_posting_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> RepoResult<Option<Posting>> {
        let row: Option<PostingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM postings WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(self.pool())
        .await?;
        row.map(Posting::try_from).transpose()
    }

    async fn try_claim_posting(
        &self,
        tenant_id: &str,
        posting_id: Uuid,
        now: i64,
    ) -> RepoResult<Option<Posting>> {
        // Conditional update: only one caller sees the row come back
        let row: Option<PostingRow> = sqlx::query_as(&format!(
            "UPDATE postings SET status = 'POSTING_REQUESTED', requested_at = $1, updated_at = $1 \
             WHERE tenant_id = $2 AND id = $3 AND status = 'READY_TO_POST' \
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .bind(tenant_id)
        .bind(posting_id)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) => Posting::try_from(row).map(Some),
            None => {
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM postings WHERE tenant_id = $1 AND id = $2")
                        .bind(tenant_id)
                        .bind(posting_id)
                        .fetch_optional(self.pool())
                        .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(RepoError::NotFound(format!("posting {posting_id}"))),
                }
            }
        }
    }

    async fn list_postings_for_reference(
        &self,
        tenant_id: &str,
        reference_id: Uuid,
    ) -> RepoResult<Vec<Posting>> {
        let rows: Vec<PostingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM postings WHERE tenant_id = $1 AND reference_id = $2 \
             ORDER BY created_at"
        ))
        .bind(tenant_id)
        .bind(reference_id)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }

    async fn list_due_postings(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<Posting>> {
        let rows: Vec<PostingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM postings \
             WHERE tenant_id = $1 AND status = 'FAILED' AND active \
               AND next_retry_at IS NOT NULL AND next_retry_at <= $2 \
             ORDER BY next_retry_at LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }

    async fn list_stale_claims(
        &self,
        tenant_id: &str,
        claimed_before: i64,
    ) -> RepoResult<Vec<Posting>> {
        let rows: Vec<PostingRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM postings \
             WHERE tenant_id = $1 AND status = 'POSTING_REQUESTED' AND requested_at < $2"
        ))
        .bind(tenant_id)
        .bind(claimed_before)
        .fetch_all(self.pool())
        .await?;
        collect(rows)
    }
}

impl PgRepository {
    /// Full row write, optionally guarded by the stored status
    async fn write_posting(
        &self,
        posting: &Posting,
        expected: Option<PostingStatus>,
    ) -> RepoResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE postings SET
                status = $1, document = $2, supply_amount = $3, vat_amount = $4, total_amount = $5,
                erp_reference = $6, retry_count = $7, next_retry_at = $8, last_error = $9,
                last_error_code = $10, active = $11, requested_at = $12, posted_at = $13,
                updated_at = $14
            WHERE tenant_id = $15 AND id = $16 AND ($17::text IS NULL OR status = $17)
            "#,
        )
        .bind(posting.status.as_str())
        .bind(posting.document.as_ref().map(Json))
        .bind(posting.supply_amount)
        .bind(posting.vat_amount)
        .bind(posting.total_amount)
        .bind(&posting.erp_reference)
        .bind(posting.retry_count)
        .bind(posting.next_retry_at)
        .bind(&posting.last_error)
        .bind(posting.last_error_code.map(i32::from))
        .bind(posting.active)
        .bind(posting.requested_at)
        .bind(posting.posted_at)
        .bind(posting.updated_at)
        .bind(&posting.tenant_id)
        .bind(posting.id)
        .bind(expected.map(|s| s.as_str()))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
