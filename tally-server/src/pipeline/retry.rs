//! Retry backoff policy and the scheduler that re-dispatches due work
//!
//! Failed units store their own `next_retry_at`; the scheduler only picks up
//! units that are still active and whose time has passed.

use futures::StreamExt;
use rand::Rng;
use shared::error::AppResult;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::gateway::ErpPostingGateway;
use super::settlement::SettlementReconciler;
use super::shipment::ShipmentPipeline;
use super::sync::SyncOrchestrator;
use crate::config::Config;
use crate::db::Repositories;

/// Capped exponential backoff, jittered downward
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Failures allowed before automation gives up
    pub max_attempts: u32,
    /// Fraction of the delay randomly removed, 0.0 - 1.0
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.retry_base_delay,
            cap: config.retry_max_delay,
            max_attempts: config.retry_max_attempts,
            jitter: config.retry_jitter,
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let shave = rng.gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 - shave)
    }

    pub fn has_budget(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// When the unit may run again after its `failures`-th failure;
    /// `None` once the budget is spent.
    pub fn next_retry_at(&self, failures: u32, now: i64) -> Option<i64> {
        if !self.has_budget(failures) {
            return None;
        }
        let delay = self.jittered_delay(failures.max(1), &mut rand::thread_rng());
        Some(now + delay.as_millis() as i64)
    }
}

/// Units re-dispatched by one [`RetryScheduler::dispatch_due`] pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sync_jobs: usize,
    pub postings: usize,
    pub shipments: usize,
    pub settlements: usize,
    pub released_claims: usize,
    /// Tenants whose pass stopped on an error
    pub failed_tenants: usize,
}

impl DispatchSummary {
    pub fn total(&self) -> usize {
        self.sync_jobs + self.postings + self.shipments + self.settlements
    }
}

/// Re-dispatches failed units whose `next_retry_at` has passed
///
/// Inactive (cancelled) units never show up in the due lists.
pub struct RetryScheduler {
    repos: Repositories,
    sync: Arc<SyncOrchestrator>,
    gateway: Arc<ErpPostingGateway>,
    shipments: Arc<ShipmentPipeline>,
    settlements: Arc<SettlementReconciler>,
    concurrency: usize,
    batch_size: i64,
}

impl RetryScheduler {
    pub fn new(
        repos: Repositories,
        sync: Arc<SyncOrchestrator>,
        gateway: Arc<ErpPostingGateway>,
        shipments: Arc<ShipmentPipeline>,
        settlements: Arc<SettlementReconciler>,
        concurrency: usize,
    ) -> Self {
        Self {
            repos,
            sync,
            gateway,
            shipments,
            settlements,
            concurrency: concurrency.max(1),
            batch_size: 100,
        }
    }

    pub async fn dispatch_due(&self, now: i64) -> AppResult<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        for tenant_id in self.repos.active_tenants().await? {
            if let Err(e) = self.dispatch_tenant(&tenant_id, now, &mut summary).await {
                summary.failed_tenants += 1;
                tracing::error!(tenant_id = %tenant_id, error = %e, "Retry pass failed for tenant");
            }
        }
        if summary.total() > 0 || summary.released_claims > 0 || summary.failed_tenants > 0 {
            tracing::info!(
                sync_jobs = summary.sync_jobs,
                postings = summary.postings,
                shipments = summary.shipments,
                settlements = summary.settlements,
                released_claims = summary.released_claims,
                failed_tenants = summary.failed_tenants,
                "Retry pass dispatched"
            );
        }
        Ok(summary)
    }

    async fn dispatch_tenant(
        &self,
        tenant_id: &str,
        now: i64,
        summary: &mut DispatchSummary,
    ) -> AppResult<()> {
        summary.released_claims += self.gateway.release_stale_claims(tenant_id, now).await?;

        let jobs = self
            .repos
            .sync_jobs
            .list_due_sync_jobs(tenant_id, now, self.batch_size)
            .await?;
        summary.sync_jobs += self
            .fan_out("sync_job", jobs, |job| async move {
                self.sync.retry_job(tenant_id, job.id).await.map(|_| ())
            })
            .await;

        let postings = self
            .repos
            .postings
            .list_due_postings(tenant_id, now, self.batch_size)
            .await?;
        summary.postings += self
            .fan_out("posting", postings, |posting| async move {
                self.gateway.resubmit(tenant_id, posting.id).await.map(|_| ())
            })
            .await;

        let shipments = self
            .repos
            .shipments
            .list_due_shipments(tenant_id, now, self.shipments.max_retries(), self.batch_size)
            .await?;
        summary.shipments += self
            .fan_out("shipment", shipments, |shipment| async move {
                self.shipments.push_to_market(tenant_id, shipment.id).await.map(|_| ())
            })
            .await;

        let batches = self
            .repos
            .settlements
            .list_due_settlement_batches(tenant_id, now, self.batch_size)
            .await?;
        summary.settlements += self
            .fan_out("settlement", batches, |batch| async move {
                self.settlements.retry_batch(tenant_id, batch.id).await.map(|_| ())
            })
            .await;
        Ok(())
    }

    async fn fan_out<T, F, Fut>(&self, unit: &'static str, items: Vec<T>, run: F) -> usize
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let dispatched = AtomicUsize::new(0);
        futures::stream::iter(items)
            .for_each_concurrent(self.concurrency, |item| {
                let attempt = run(item);
                let dispatched = &dispatched;
                async move {
                    match attempt.await {
                        Ok(()) => {
                            dispatched.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!(
                            unit,
                            code = %e.code,
                            error = %e.message,
                            "Retry dispatch rejected"
                        ),
                    }
                }
            })
            .await;
        dispatched.into_inner()
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(300),
            max_attempts: 5,
            jitter,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let p = policy(0.0);
        assert_eq!(p.delay(1), Duration::from_secs(30));
        assert_eq!(p.delay(2), Duration::from_secs(60));
        assert_eq!(p.delay(3), Duration::from_secs(120));
        assert_eq!(p.delay(4), Duration::from_secs(240));
        assert_eq!(p.delay(5), Duration::from_secs(300));
        assert_eq!(p.delay(60), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_only_shortens() {
        let p = policy(0.2);
        let mut rng = rand::thread_rng();
        for attempt in 1..=6 {
            for _ in 0..50 {
                let d = p.jittered_delay(attempt, &mut rng);
                assert!(d <= p.delay(attempt));
                assert!(d >= p.delay(attempt).mul_f64(0.8));
            }
        }
    }

    #[test]
    fn test_budget_exhaustion_stops_rescheduling() {
        let p = policy(0.0);
        assert_eq!(p.next_retry_at(1, 1_000), Some(31_000));
        assert_eq!(p.next_retry_at(4, 0), Some(240_000));
        assert_eq!(p.next_retry_at(5, 0), None);
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::RetryScheduler;
    use crate::adapters::AdapterError;
    use crate::db::{RepoError, RepoResult, SyncJobRepository};
    use crate::testkit::{TestEngine, raw_order, sample_document};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use shared::models::{PostingStatus, Store, SyncJob, SyncJobStatus, SyncTrigger, TimeRange};
    use shared::util::now_millis;
    use std::sync::Arc;
    use uuid::Uuid;

    /// Sync jobs whose due list is unreadable for one tenant
    struct UnreadableTenant {
        inner: Arc<dyn SyncJobRepository>,
        tenant_id: &'static str,
    }

    #[async_trait]
    impl SyncJobRepository for UnreadableTenant {
        async fn insert_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
            self.inner.insert_sync_job(job).await
        }
        async fn update_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
            self.inner.update_sync_job(job).await
        }
        async fn find_sync_job(&self, tenant_id: &str, job_id: Uuid) -> RepoResult<Option<SyncJob>> {
            self.inner.find_sync_job(tenant_id, job_id).await
        }
        async fn find_in_flight_job(&self, tenant_id: &str, store_id: Uuid) -> RepoResult<Option<SyncJob>> {
            self.inner.find_in_flight_job(tenant_id, store_id).await
        }
        async fn list_due_sync_jobs(&self, tenant_id: &str, now: i64, limit: i64) -> RepoResult<Vec<SyncJob>> {
            if tenant_id == self.tenant_id {
                return Err(RepoError::Database("relation is locked".into()));
            }
            self.inner.list_due_sync_jobs(tenant_id, now, limit).await
        }
    }

    /// Past every backoff the default policy can produce
    fn later() -> i64 {
        now_millis() + 2 * 3_600_000
    }

    #[tokio::test]
    async fn test_due_sync_job_and_posting_are_redispatched() {
        let t = TestEngine::new().await;
        t.marketplace.fail_fetch(AdapterError::Timeout);
        t.marketplace.add_orders(vec![raw_order("MO-1", 2_000, &[("P1", "S1", dec!(1100))])]);
        let job = t
            .engine
            .sync
            .start_sync(
                &t.tenant_id,
                t.store.id,
                TimeRange::new(1_000, 10_000).unwrap(),
                SyncTrigger::Manual,
            )
            .await
            .unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);

        t.erp.fail_post(AdapterError::Network("reset".into()));
        let posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        t.engine.gateway.submit(&t.tenant_id, posting.id).await.unwrap();

        // nothing is due yet
        let summary = t.engine.retry.dispatch_due(now_millis()).await.unwrap();
        assert_eq!(summary.total(), 0);

        let summary = t.engine.retry.dispatch_due(later()).await.unwrap();
        assert_eq!(summary.sync_jobs, 1);
        assert_eq!(summary.postings, 1);

        let job = t
            .engine
            .repos
            .sync_jobs
            .find_sync_job(&t.tenant_id, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, SyncJobStatus::Completed);
        let posting = t
            .engine
            .repos
            .postings
            .find_posting(&t.tenant_id, posting.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(posting.status, PostingStatus::Posted);
    }

    #[tokio::test]
    async fn test_cancelled_and_fatal_units_are_skipped() {
        let t = TestEngine::new().await;
        t.marketplace.fail_fetch(AdapterError::Timeout);
        let job = t
            .engine
            .sync
            .start_sync(
                &t.tenant_id,
                t.store.id,
                TimeRange::new(1_000, 10_000).unwrap(),
                SyncTrigger::Manual,
            )
            .await
            .unwrap();
        t.engine.sync.cancel_job(&t.tenant_id, job.id).await.unwrap();

        t.erp.fail_post(AdapterError::Forbidden("no scope".into()));
        let posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        t.engine.gateway.submit(&t.tenant_id, posting.id).await.unwrap();

        let summary = t.engine.retry.dispatch_due(later()).await.unwrap();
        assert_eq!(summary.total(), 0);
        assert_eq!(t.marketplace.fetch_calls(), 1);
        assert_eq!(t.erp.post_calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_tenant_does_not_stop_the_pass() {
        let t = TestEngine::new().await;
        // sorts ahead of the healthy tenant
        let broken = Store::new("tenant-0", "Broken store", "COUPANG");
        t.engine.repos.stores.insert_store(&broken).await.unwrap();

        t.erp.fail_post(AdapterError::Network("reset".into()));
        let posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        t.engine.gateway.submit(&t.tenant_id, posting.id).await.unwrap();

        let mut repos = t.engine.repos.clone();
        repos.sync_jobs = Arc::new(UnreadableTenant {
            inner: repos.sync_jobs.clone(),
            tenant_id: "tenant-0",
        });
        let scheduler = RetryScheduler::new(
            repos,
            t.engine.sync.clone(),
            t.engine.gateway.clone(),
            t.engine.shipments.clone(),
            t.engine.settlements.clone(),
            2,
        );

        let summary = scheduler.dispatch_due(later()).await.unwrap();
        assert_eq!(summary.failed_tenants, 1);
        assert_eq!(summary.postings, 1);
        let posting = t
            .engine
            .repos
            .postings
            .find_posting(&t.tenant_id, posting.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(posting.status, PostingStatus::Posted);
    }
}
