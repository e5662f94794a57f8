use async_trait::async_trait;
use shared::models::SyncJob;
use uuid::Uuid;

use super::{PgRepository, parse_enum};
use crate::db::{RepoError, RepoResult, SyncJobRepository};

#[derive(sqlx::FromRow)]
struct SyncJobRow {
    id: Uuid,
    tenant_id: String,
    store_id: Uuid,
    trigger: String,
    status: String,
    sync_start_time: i64,
    sync_end_time: i64,
    total_fetched: i32,
    created_count: i32,
    updated_count: i32,
    failed_count: i32,
    attempt_count: i32,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    active: bool,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = RepoError;

    fn try_from(row: SyncJobRow) -> RepoResult<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            store_id: row.store_id,
            trigger: parse_enum(&row.trigger)?,
            status: parse_enum(&row.status)?,
            sync_start_time: row.sync_start_time,
            sync_end_time: row.sync_end_time,
            total_fetched: row.total_fetched,
            created_count: row.created_count,
            updated_count: row.updated_count,
            failed_count: row.failed_count,
            attempt_count: row.attempt_count,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            active: row.active,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, tenant_id, store_id, trigger, status, sync_start_time, sync_end_time, \
    total_fetched, created_count, updated_count, failed_count, attempt_count, next_retry_at, \
    last_error, active, started_at, finished_at, created_at, updated_at";

fn collect(rows: Vec<SyncJobRow>) -> RepoResult<Vec<SyncJob>> {
    rows.into_iter().map(SyncJob::try_from).collect()
}

#[async_trait]
impl SyncJobRepository for PgRepository {
    async fn insert_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_jobs ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        ))
        .bind(job.id)
        .bind(&job.tenant_id)
        .bind(job.store_id)
        .bind(job.trigger.as_str())
        .bind(job.status.as_str())
        .bind(job.sync_start_time)
        .bind(job.sync_end_time)
        .bind(job.total_fetched)
        .bind(job.created_count)
        .bind(job.updated_count)
        .bind(job.failed_count)
        .bind(job.attempt_count)
        .bind(job.next_retry_at)
        .bind(&job.last_error)
        .bind(job.active)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                status = $1, total_fetched = $2, created_count = $3, updated_count = $4,
                failed_count = $5, attempt_count = $6, next_retry_at = $7, last_error = $8,
                active = $9, started_at = $10, finished_at = $11, updated_at = $12
            WHERE tenant_id = $13 AND id = $14
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.total_fetched)
        .bind(job.created_count)
        .bind(job.updated_count)
        .bind(job.failed_count)
        .bind(job.attempt_count)
        .bind(job.next_retry_at)
        .bind(&job.last_error)
        .bind(job.active)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .bind(&job.tenant_id)
        .bind(job.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("sync job {}", job.id)));
        }
        Ok(())
    }

    async fn find_sync_job(&self, tenant_id: &str, job_id: Uuid) -> RepoResult<Option<SyncJob>> {
        let row: Option<SyncJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sync_jobs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(SyncJob::try_from).transpose()
    }

    async fn find_in_flight_job(
        &self,
        tenant_id: &str,
        store_id: Uuid,
    ) -> RepoResult<Option<SyncJob>> {
        let row: Option<SyncJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sync_jobs \
             WHERE tenant_id = $1 AND store_id = $2 AND status IN ('PENDING', 'RUNNING')"
        ))
        .bind(tenant_id)
        .bind(store_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(SyncJob::try_from).transpose()
    }

    async fn list_due_sync_jobs(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<SyncJob>> {
        let rows: Vec<SyncJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sync_jobs \
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
}
