//! Periodic pipeline workers
//!
//! Each worker ticks on its configured interval, runs one scan, and returns
//! when the shutdown token is cancelled. A failed scan is logged and the
//! next tick tries again; one tenant's failure does not skip the others.

use shared::error::AppResult;
use shared::util::now_millis;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::tasks::{BackgroundTasks, TaskKind};

/// Work items picked up per tenant per tick
const SCAN_BATCH: i64 = 100;

/// Fail jobs left in flight by a previous process
pub async fn recover_interrupted(engine: &Engine) {
    match engine.sync.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!(jobs = n, "Interrupted sync jobs marked failed for retry"),
        Err(e) => tracing::error!(error = %e, "Sync job recovery failed"),
    }
}

/// Register every periodic worker on `tasks`
pub fn spawn_all(tasks: &mut BackgroundTasks, engine: &Engine) {
    let config = &engine.config;

    let e = engine.clone();
    spawn_loop(tasks, "scheduled_sync", config.sync_interval, move || {
        let e = e.clone();
        async move {
            let started = e.sync.run_scheduled(now_millis()).await?;
            if started > 0 {
                tracing::info!(stores = started, "Scheduled sync pass finished");
            }
            Ok(())
        }
    });

    let e = engine.clone();
    spawn_loop(tasks, "order_posting", config.posting_scan_interval, move || {
        let e = e.clone();
        async move {
            for tenant_id in e.repos.active_tenants().await? {
                match e.order_posting.post_pending(&tenant_id, SCAN_BATCH).await {
                    Ok(0) => {}
                    Ok(posted) => tracing::info!(tenant_id = %tenant_id, orders = posted, "Orders posted"),
                    Err(err) => tracing::error!(tenant_id = %tenant_id, error = %err, "Order posting scan failed"),
                }
            }
            Ok(())
        }
    });

    let e = engine.clone();
    spawn_loop(tasks, "shipment_push", config.shipment_scan_interval, move || {
        let e = e.clone();
        async move {
            for tenant_id in e.repos.active_tenants().await? {
                match e.shipments.push_ready(&tenant_id, SCAN_BATCH).await {
                    Ok(0) => {}
                    Ok(pushed) => tracing::info!(tenant_id = %tenant_id, shipments = pushed, "Tracking pushed"),
                    Err(err) => tracing::error!(tenant_id = %tenant_id, error = %err, "Shipment push scan failed"),
                }
            }
            Ok(())
        }
    });

    let e = engine.clone();
    spawn_loop(tasks, "retry_scheduler", config.retry_scan_interval, move || {
        let e = e.clone();
        async move {
            let summary = e.retry.dispatch_due(now_millis()).await?;
            if summary.total() > 0 || summary.released_claims > 0 {
                tracing::info!(
                    sync_jobs = summary.sync_jobs,
                    postings = summary.postings,
                    shipments = summary.shipments,
                    settlements = summary.settlements,
                    released_claims = summary.released_claims,
                    failed_tenants = summary.failed_tenants,
                    "Retry pass finished"
                );
            }
            Ok(())
        }
    });
}

fn spawn_loop<F, Fut>(tasks: &mut BackgroundTasks, name: &'static str, period: Duration, scan: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    let token = tasks.shutdown_token();
    tasks.spawn(name, TaskKind::Periodic, run_periodic(name, period, token, scan));
}

async fn run_periodic<F, Fut>(name: &'static str, period: Duration, token: CancellationToken, scan: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(worker = name, period_secs = period.as_secs(), "Worker started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = scan().await {
                    tracing::error!(worker = name, error = %e, "Worker pass failed");
                }
            }
        }
    }

    tracing::info!(worker = name, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{TestEngine, raw_order};
    use rust_decimal_macros::dec;
    use shared::models::OrderPostingStatus;

    #[tokio::test]
    async fn test_periodic_worker_runs_until_cancelled() {
        let t = TestEngine::new().await;
        t.map("P1", "S1", "ERP-001").await;
        let order = t
            .insert_order(raw_order("MO-1", 2_000, &[("P1", "S1", dec!(11000))]), dec!(0))
            .await;

        let mut tasks = BackgroundTasks::new();
        spawn_all(&mut tasks, &t.engine);
        assert_eq!(tasks.len(), 4);

        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tasks.check_health(), 0);
        tasks.shutdown().await;

        let stored = t
            .engine
            .repos
            .orders
            .find_order(&t.tenant_id, order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.posting_status, OrderPostingStatus::Posted);
        assert_eq!(t.erp.post_calls(), 1);
    }

    #[tokio::test]
    async fn test_recover_interrupted_is_quiet_without_jobs() {
        let t = TestEngine::new().await;
        recover_interrupted(&t.engine).await;
        assert_eq!(t.marketplace.fetch_calls(), 0);
    }
}
