//! Order ingestion
//!
//! One [`SyncJob`] per run. A store has at most one PENDING/RUNNING job: the
//! in-process registry rejects concurrent starts, and the repository's
//! in-flight constraint covers other processes.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{
    CredentialType, MarketOrder, Store, SyncJob, SyncJobStatus, SyncTrigger, TimeRange,
};
use shared::util::now_millis;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::adapters::{AdapterRegistry, MarketplaceAdapter};
use crate::config::Config;
use crate::db::{RepoError, Repositories, UpsertOutcome};
use crate::vault::CredentialVault;

struct ActiveSync {
    job_id: Option<Uuid>,
    cancel: CancellationToken,
}

/// Removes the store's registry entry when the run ends, however it ends
struct ActiveSyncGuard<'a> {
    registry: &'a DashMap<Uuid, ActiveSync>,
    store_id: Uuid,
}

impl Drop for ActiveSyncGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.store_id);
    }
}

pub struct SyncOrchestrator {
    repos: Repositories,
    adapters: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    policy: RetryPolicy,
    interval: Duration,
    initial_lookback: Duration,
    concurrency: usize,
    active: DashMap<Uuid, ActiveSync>,
}

impl SyncOrchestrator {
    pub fn new(
        repos: Repositories,
        adapters: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        config: &Config,
    ) -> Self {
        Self {
            repos,
            adapters,
            vault,
            policy: RetryPolicy::from_config(config),
            interval: config.sync_interval,
            initial_lookback: config.sync_initial_lookback,
            concurrency: config.worker_concurrency,
            active: DashMap::new(),
        }
    }

    /// Start and run a sync for one store over `range`
    ///
    /// Returns the job in its final state. Fetch failures are recorded on the
    /// job; only inputs that cannot be processed at all are returned as errors.
    pub async fn start_sync(
        &self,
        tenant_id: &str,
        store_id: Uuid,
        range: TimeRange,
        trigger: SyncTrigger,
    ) -> AppResult<SyncJob> {
        let range = TimeRange::new(range.start, range.end)?;
        let store = self.active_store(tenant_id, store_id).await?;
        let adapter = self.adapters.marketplace(&store.marketplace)?;

        let (_guard, cancel) = self.claim(store_id)?;
        if let Some(running) = self.repos.sync_jobs.find_in_flight_job(tenant_id, store_id).await? {
            return Err(already_running(store_id, Some(running.id)));
        }

        let job = SyncJob::new(tenant_id, store_id, range, trigger);
        match self.repos.sync_jobs.insert_sync_job(&job).await {
            Ok(()) => {}
            Err(RepoError::Duplicate(_)) => return Err(already_running(store_id, None)),
            Err(e) => return Err(e.into()),
        }
        self.bind_job(store_id, job.id);

        tracing::info!(
            tenant_id = %tenant_id,
            store_id = %store_id,
            job_id = %job.id,
            trigger = %trigger,
            start = range.start,
            end = range.end,
            "Sync started"
        );
        Ok(self.run_job(&store, adapter.as_ref(), job, &cancel).await)
    }

    /// Re-run a FAILED job whose retry is due (FAILED -> PENDING -> RUNNING)
    pub async fn retry_job(&self, tenant_id: &str, job_id: Uuid) -> AppResult<SyncJob> {
        let mut job = self.find_job(tenant_id, job_id).await?;
        if !job.active {
            return Err(AppError::with_message(
                ErrorCode::SyncJobCancelled,
                format!("sync job {job_id} was cancelled"),
            ));
        }
        let store = self.active_store(tenant_id, job.store_id).await?;
        let adapter = self.adapters.marketplace(&store.marketplace)?;

        let (_guard, cancel) = self.claim(job.store_id)?;
        job.transition(SyncJobStatus::Pending, now_millis())?;
        match self.repos.sync_jobs.update_sync_job(&job).await {
            Ok(()) => {}
            Err(RepoError::Duplicate(_)) => return Err(already_running(job.store_id, None)),
            Err(e) => return Err(e.into()),
        }
        self.bind_job(job.store_id, job.id);

        tracing::info!(
            tenant_id = %tenant_id,
            job_id = %job.id,
            attempt = job.attempt_count + 1,
            "Sync retry started"
        );
        Ok(self.run_job(&store, adapter.as_ref(), job, &cancel).await)
    }

    /// Deactivate a job; a running fetch stops at the next page boundary
    pub async fn cancel_job(&self, tenant_id: &str, job_id: Uuid) -> AppResult<SyncJob> {
        let mut job = self.find_job(tenant_id, job_id).await?;
        job.active = false;
        job.next_retry_at = None;
        job.updated_at = now_millis();
        self.repos.sync_jobs.update_sync_job(&job).await?;

        if let Some(entry) = self.active.get(&job.store_id)
            && entry.job_id == Some(job_id)
        {
            entry.cancel.cancel();
        }
        tracing::info!(tenant_id = %tenant_id, job_id = %job_id, "Sync job cancelled");
        Ok(job)
    }

    /// Start SCHEDULED syncs for every active store that is due. Returns how
    /// many runs were started.
    pub async fn run_scheduled(&self, now: i64) -> AppResult<usize> {
        let interval_ms = self.interval.as_millis() as i64;
        let lookback_ms = self.initial_lookback.as_millis() as i64;
        let due: Vec<Store> = self
            .repos
            .stores
            .list_active_stores()
            .await?
            .into_iter()
            .filter(|s| s.last_synced_at.is_none_or(|at| now - at >= interval_ms))
            .collect();

        let started = AtomicUsize::new(0);
        futures::stream::iter(due)
            .for_each_concurrent(self.concurrency, |store| {
                let started = &started;
                async move {
                    let start = store.last_synced_at.unwrap_or(now - lookback_ms);
                    let Ok(range) = TimeRange::new(start, now) else {
                        return;
                    };
                    match self
                        .start_sync(&store.tenant_id, store.id, range, SyncTrigger::Scheduled)
                        .await
                    {
                        Ok(_) => {
                            started.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) if e.code == ErrorCode::SyncAlreadyRunning => {
                            tracing::debug!(store_id = %store.id, "Scheduled sync skipped, run in flight");
                        }
                        Err(e) => {
                            tracing::warn!(
                                tenant_id = %store.tenant_id,
                                store_id = %store.id,
                                error = %e,
                                "Scheduled sync not started"
                            );
                        }
                    }
                }
            })
            .await;
        Ok(started.into_inner())
    }

    /// Fail jobs left PENDING/RUNNING by a previous process so they can retry
    pub async fn recover_interrupted(&self) -> AppResult<usize> {
        let mut recovered = 0;
        for store in self.repos.stores.list_active_stores().await? {
            if self.active.contains_key(&store.id) {
                continue;
            }
            let Some(mut job) = self
                .repos
                .sync_jobs
                .find_in_flight_job(&store.tenant_id, store.id)
                .await?
            else {
                continue;
            };
            let now = now_millis();
            if job.status == SyncJobStatus::Pending {
                job.transition(SyncJobStatus::Running, now)?;
            }
            job.last_error = Some("interrupted by restart".into());
            job.transition(SyncJobStatus::Failed, now)?;
            job.next_retry_at = self.policy.next_retry_at(job.attempt_count as u32, now);
            self.repos.sync_jobs.update_sync_job(&job).await?;
            tracing::warn!(tenant_id = %job.tenant_id, job_id = %job.id, "Recovered interrupted sync job");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub fn is_running(&self, store_id: Uuid) -> bool {
        self.active.contains_key(&store_id)
    }

    async fn active_store(&self, tenant_id: &str, store_id: Uuid) -> AppResult<Store> {
        let store = self
            .repos
            .stores
            .find_store(tenant_id, store_id)
            .await?
            .ok_or_else(|| {
                AppError::with_message(ErrorCode::StoreNotFound, format!("store {store_id} not found"))
            })?;
        if !store.active {
            return Err(AppError::with_message(
                ErrorCode::StoreInactive,
                format!("store {store_id} is inactive"),
            ));
        }
        Ok(store)
    }

    async fn find_job(&self, tenant_id: &str, job_id: Uuid) -> AppResult<SyncJob> {
        self.repos
            .sync_jobs
            .find_sync_job(tenant_id, job_id)
            .await?
            .ok_or_else(|| {
                AppError::with_message(ErrorCode::SyncJobNotFound, format!("sync job {job_id} not found"))
            })
    }

    /// Atomic check-and-insert on the per-store registry
    fn claim(&self, store_id: Uuid) -> AppResult<(ActiveSyncGuard<'_>, CancellationToken)> {
        match self.active.entry(store_id) {
            Entry::Occupied(entry) => Err(already_running(store_id, entry.get().job_id)),
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                entry.insert(ActiveSync {
                    job_id: None,
                    cancel: cancel.clone(),
                });
                Ok((
                    ActiveSyncGuard {
                        registry: &self.active,
                        store_id,
                    },
                    cancel,
                ))
            }
        }
    }

    fn bind_job(&self, store_id: Uuid, job_id: Uuid) {
        if let Some(mut entry) = self.active.get_mut(&store_id) {
            entry.job_id = Some(job_id);
        }
    }

    async fn run_job(
        &self,
        store: &Store,
        adapter: &dyn MarketplaceAdapter,
        mut job: SyncJob,
        cancel: &CancellationToken,
    ) -> SyncJob {
        if let Err(e) = job.transition(SyncJobStatus::Running, now_millis()) {
            tracing::error!(job_id = %job.id, error = %e, "Sync job could not start");
            return job;
        }
        if let Err(e) = self.repos.sync_jobs.update_sync_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist RUNNING sync job");
        }

        match self.fetch_all(store, adapter, &mut job, cancel).await {
            Ok(()) => self.complete(store, job).await,
            Err(e) => self.fail(job, e).await,
        }
    }

    async fn fetch_all(
        &self,
        store: &Store,
        adapter: &dyn MarketplaceAdapter,
        job: &mut SyncJob,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let credentials = self
            .vault
            .load(
                &job.tenant_id,
                Some(store.id),
                CredentialType::Marketplace,
                adapter.credential_keys(),
            )
            .await?;
        let range = job.range();
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::with_message(ErrorCode::SyncJobCancelled, "sync cancelled"));
            }

            let page = adapter
                .fetch_orders(&credentials, range, cursor.as_deref())
                .await?;
            for raw in page.orders {
                job.total_fetched += 1;
                let order_id = raw.marketplace_order_id.clone();
                let order = MarketOrder::from_raw(&job.tenant_id, store.id, &store.marketplace, raw);
                match self.repos.orders.upsert_order(&order).await {
                    Ok(UpsertOutcome::Created) => job.created_count += 1,
                    Ok(UpsertOutcome::Updated) => job.updated_count += 1,
                    Err(e) => {
                        job.failed_count += 1;
                        tracing::warn!(
                            job_id = %job.id,
                            marketplace_order_id = %order_id,
                            error = %e,
                            "Order upsert failed"
                        );
                    }
                }
            }
            job.updated_at = now_millis();
            if let Err(e) = self.repos.sync_jobs.update_sync_job(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to persist sync progress");
            }

            match page.next_cursor {
                None => return Ok(()),
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(AppError::with_message(
                        ErrorCode::MalformedPayload,
                        format!("marketplace returned the same cursor twice: {next}"),
                    ));
                }
                Some(next) => cursor = Some(next),
            }
        }
    }

    async fn complete(&self, store: &Store, mut job: SyncJob) -> SyncJob {
        if let Err(e) = job.transition(SyncJobStatus::Completed, now_millis()) {
            tracing::error!(job_id = %job.id, error = %e, "Sync completion rejected");
            return job;
        }
        if let Err(e) = self.repos.sync_jobs.update_sync_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist COMPLETED sync job");
        }
        if let Err(e) = self
            .repos
            .stores
            .mark_store_synced(&job.tenant_id, store.id, job.sync_end_time)
            .await
        {
            tracing::warn!(store_id = %store.id, error = %e, "Failed to advance store sync mark");
        }
        tracing::info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            fetched = job.total_fetched,
            created = job.created_count,
            updated = job.updated_count,
            failed = job.failed_count,
            "Sync completed"
        );
        job
    }

    async fn fail(&self, mut job: SyncJob, err: AppError) -> SyncJob {
        let now = now_millis();
        job.last_error = Some(err.message.clone());
        if let Err(e) = job.transition(SyncJobStatus::Failed, now) {
            tracing::error!(job_id = %job.id, error = %e, "Sync failure transition rejected");
            return job;
        }

        let cancelled = err.code == ErrorCode::SyncJobCancelled;
        if cancelled {
            job.active = false;
        } else if err.is_retryable() {
            job.next_retry_at = self.policy.next_retry_at(job.attempt_count as u32, now);
            if job.next_retry_at.is_none() {
                job.last_error = Some(format!("{} (retry budget exhausted)", err.message));
            }
        }
        if let Err(e) = self.repos.sync_jobs.update_sync_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist FAILED sync job");
        }

        tracing::warn!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            code = %err.code,
            kind = err.kind().name(),
            attempt = job.attempt_count,
            next_retry_at = ?job.next_retry_at,
            error = %err.message,
            "Sync failed"
        );
        job
    }
}

fn already_running(store_id: Uuid, job_id: Option<Uuid>) -> AppError {
    let err = AppError::with_message(
        ErrorCode::SyncAlreadyRunning,
        format!("store {store_id} already has an active sync job"),
    )
    .with_detail("store_id", store_id.to_string());
    match job_id {
        Some(id) => err.with_detail("job_id", id.to_string()),
        None => err,
    }
}
