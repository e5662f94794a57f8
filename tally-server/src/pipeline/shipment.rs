//! Shipment issuance and marketplace push
//!
//! Two axes per shipment: the lifecycle ([`ShipmentStatus`]) and the
//! marketplace push ([`MarketPushStatus`]). Duplicate pushes are stopped by
//! the SUCCESS check, not by a lock, so retry workers may run at least once.

use futures::StreamExt;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{CredentialType, MarketPushStatus, Shipment, ShipmentStatus};
use shared::util::now_millis;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::adapters::{AdapterRegistry, MarketplaceAdapter, ShipmentPushRequest};
use crate::audit_log;
use crate::config::Config;
use crate::db::{RepoError, Repositories};
use crate::vault::CredentialVault;

pub struct ShipmentPipeline {
    repos: Repositories,
    adapters: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    policy: RetryPolicy,
    max_retries: i32,
    concurrency: usize,
}

impl ShipmentPipeline {
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
            max_retries: config.shipment_max_retries,
            concurrency: config.worker_concurrency,
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// The order's shipment, created in READY on first call
    pub async fn create_for_order(&self, tenant_id: &str, order_id: Uuid) -> AppResult<Shipment> {
        if let Some(existing) = self.repos.shipments.find_shipment_by_order(tenant_id, order_id).await? {
            return Ok(existing);
        }
        let order = self
            .repos
            .orders
            .find_order(tenant_id, order_id)
            .await?
            .ok_or_else(|| {
                AppError::with_message(ErrorCode::OrderNotFound, format!("order {order_id} not found"))
            })?;

        let shipment = Shipment::for_order(&order);
        match self.repos.shipments.insert_shipment(&shipment).await {
            Ok(()) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    shipment_id = %shipment.id,
                    order_id = %order_id,
                    "Shipment created"
                );
                Ok(shipment)
            }
            Err(RepoError::Duplicate(_)) => self
                .repos
                .shipments
                .find_shipment_by_order(tenant_id, order_id)
                .await?
                .ok_or_else(|| shipment_not_found(shipment.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// READY or FAILED -> INVOICE_REQUESTED
    pub async fn request_invoice(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let mut shipment = self.find_active(tenant_id, shipment_id).await?;
        shipment.transition(ShipmentStatus::InvoiceRequested, now_millis())?;
        self.repos.shipments.update_shipment(&shipment).await?;
        Ok(shipment)
    }

    /// Attach a carrier tracking number to the order's shipment
    ///
    /// Once a tracking number has been pushed successfully, replacing it needs
    /// `override_pushed`; the override resets the push axis to PENDING so the
    /// new number is pushed again.
    pub async fn issue_invoice(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        carrier_code: &str,
        tracking_number: &str,
        override_pushed: bool,
    ) -> AppResult<Shipment> {
        let tracking_number = tracking_number.trim();
        if tracking_number.is_empty() {
            return Err(AppError::with_message(
                ErrorCode::TrackingNumberRequired,
                "tracking number must not be empty",
            ));
        }
        let mut shipment = self.create_for_order(tenant_id, order_id).await?;
        if !shipment.active {
            return Err(cancelled(shipment.id));
        }

        let now = now_millis();
        let reissue = shipment.has_pushed_tracking();
        if reissue {
            if !override_pushed {
                return Err(AppError::with_message(
                    ErrorCode::DuplicateTracking,
                    format!("order {order_id} already has a pushed tracking number"),
                )
                .with_detail("tracking_number", shipment.tracking_number.clone().unwrap_or_default()));
            }
            shipment.transition_push(MarketPushStatus::Pending, now)?;
        }
        if shipment.status != ShipmentStatus::InvoiceRequested {
            shipment.transition(ShipmentStatus::InvoiceRequested, now)?;
        }

        let previous = shipment.tracking_number.replace(tracking_number.to_string());
        shipment.carrier_code = Some(carrier_code.to_string());
        shipment.retry_count = 0;
        shipment.next_retry_at = None;
        shipment.last_error = None;
        shipment.transition(ShipmentStatus::InvoiceIssued, now)?;
        self.repos.shipments.update_shipment(&shipment).await?;

        if reissue {
            audit_log!(
                tenant_id,
                "tracking_reissued",
                shipment.id.to_string().as_str(),
                format!("{} -> {}", previous.unwrap_or_default(), tracking_number).as_str()
            );
        }
        tracing::info!(
            tenant_id = %tenant_id,
            shipment_id = %shipment.id,
            carrier = %carrier_code,
            reissue,
            "Invoice issued"
        );
        Ok(shipment)
    }

    /// INVOICE_REQUESTED -> FAILED when the carrier could not issue a number
    pub async fn fail_invoice(
        &self,
        tenant_id: &str,
        shipment_id: Uuid,
        reason: &str,
    ) -> AppResult<Shipment> {
        let mut shipment = self.find_active(tenant_id, shipment_id).await?;
        shipment.transition(ShipmentStatus::Failed, now_millis())?;
        shipment.last_error = Some(reason.to_string());
        shipment.next_retry_at = None;
        self.repos.shipments.update_shipment(&shipment).await?;
        tracing::warn!(tenant_id = %tenant_id, shipment_id = %shipment_id, reason, "Invoice failed");
        Ok(shipment)
    }

    /// Deliver the tracking number to the marketplace
    ///
    /// Rejected without an adapter call when the push already succeeded.
    /// Adapter failures are recorded on the returned shipment.
    pub async fn push_to_market(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let mut shipment = self.find_active(tenant_id, shipment_id).await?;
        if shipment.market_push_status == MarketPushStatus::Success {
            return Err(AppError::with_message(
                ErrorCode::MarketPushAlreadyCompleted,
                format!("shipment {shipment_id} was already pushed"),
            ));
        }
        let (Some(carrier_code), Some(tracking_number)) =
            (shipment.carrier_code.clone(), shipment.tracking_number.clone())
        else {
            return Err(AppError::with_message(
                ErrorCode::TrackingNumberRequired,
                format!("shipment {shipment_id} has no tracking number"),
            ));
        };
        let adapter = self.adapters.marketplace(&shipment.marketplace)?;

        let now = now_millis();
        match shipment.status {
            ShipmentStatus::Failed => shipment.transition(shipment.resume_status(), now)?,
            ShipmentStatus::MarketPushRequested => {}
            _ => shipment.transition(ShipmentStatus::MarketPushRequested, now)?,
        }
        shipment.transition_push(MarketPushStatus::Pushing, now)?;
        self.repos.shipments.update_shipment(&shipment).await?;

        let request = ShipmentPushRequest {
            marketplace_order_id: shipment.marketplace_order_id.clone(),
            carrier_code,
            tracking_number,
        };
        match self.call_push(adapter.as_ref(), &shipment, &request).await {
            Ok(reference) => {
                let now = now_millis();
                shipment.transition_push(MarketPushStatus::Success, now)?;
                shipment.transition(ShipmentStatus::MarketPushed, now)?;
                self.repos.shipments.update_shipment(&shipment).await?;
                tracing::info!(
                    tenant_id = %tenant_id,
                    shipment_id = %shipment_id,
                    reference = ?reference,
                    "Tracking pushed to marketplace"
                );
            }
            Err(e) => self.record_push_failure(&mut shipment, e).await?,
        }
        Ok(shipment)
    }

    /// MARKET_PUSHED -> SHIPPED
    pub async fn mark_shipped(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let mut shipment = self.find_active(tenant_id, shipment_id).await?;
        shipment.transition(ShipmentStatus::Shipped, now_millis())?;
        self.repos.shipments.update_shipment(&shipment).await?;
        Ok(shipment)
    }

    /// SHIPPED -> DELIVERED
    pub async fn mark_delivered(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let mut shipment = self.find_active(tenant_id, shipment_id).await?;
        shipment.transition(ShipmentStatus::Delivered, now_millis())?;
        self.repos.shipments.update_shipment(&shipment).await?;
        Ok(shipment)
    }

    /// Deactivate; workers and the retry scheduler skip the shipment afterwards
    pub async fn cancel(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let mut shipment = self.find(tenant_id, shipment_id).await?;
        shipment.active = false;
        shipment.next_retry_at = None;
        shipment.updated_at = now_millis();
        self.repos.shipments.update_shipment(&shipment).await?;
        audit_log!(tenant_id, "shipment_cancel", shipment_id.to_string().as_str());
        Ok(shipment)
    }

    /// FAILED shipments that ran out of automatic retries
    pub async fn list_for_manual_review(&self, tenant_id: &str) -> AppResult<Vec<Shipment>> {
        Ok(self
            .repos
            .shipments
            .list_shipments_for_review(tenant_id, self.max_retries)
            .await?)
    }

    /// Push every INVOICE_ISSUED shipment of a tenant. Returns how many pushes succeeded.
    pub async fn push_ready(&self, tenant_id: &str, limit: i64) -> AppResult<usize> {
        let ready: Vec<Shipment> = self
            .repos
            .shipments
            .list_shipments_by_status(tenant_id, ShipmentStatus::InvoiceIssued, limit)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect();

        let pushed = AtomicUsize::new(0);
        futures::stream::iter(ready)
            .for_each_concurrent(self.concurrency, |shipment| {
                let pushed = &pushed;
                async move {
                    match self.push_to_market(tenant_id, shipment.id).await {
                        Ok(s) if s.market_push_status == MarketPushStatus::Success => {
                            pushed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(
                            shipment_id = %shipment.id,
                            code = %e.code,
                            "Shipment push skipped"
                        ),
                    }
                }
            })
            .await;
        Ok(pushed.into_inner())
    }

    async fn call_push(
        &self,
        adapter: &dyn MarketplaceAdapter,
        shipment: &Shipment,
        request: &ShipmentPushRequest,
    ) -> AppResult<Option<String>> {
        let credentials = self
            .vault
            .load(
                &shipment.tenant_id,
                Some(shipment.store_id),
                CredentialType::Marketplace,
                adapter.credential_keys(),
            )
            .await?;
        let result = adapter.push_shipment(&credentials, request).await?;
        Ok(result.reference)
    }

    async fn record_push_failure(&self, shipment: &mut Shipment, err: AppError) -> AppResult<()> {
        let now = now_millis();
        shipment.transition_push(MarketPushStatus::Failed, now)?;
        shipment.transition(ShipmentStatus::Failed, now)?;
        shipment.last_error = Some(err.message.clone());
        shipment.next_retry_at = if err.is_retryable() && shipment.retry_count < self.max_retries {
            let delay = self
                .policy
                .jittered_delay(shipment.retry_count as u32, &mut rand::thread_rng());
            Some(now + delay.as_millis() as i64)
        } else {
            None
        };
        self.repos.shipments.update_shipment(shipment).await?;

        if shipment.needs_manual_review(self.max_retries) {
            tracing::error!(
                tenant_id = %shipment.tenant_id,
                shipment_id = %shipment.id,
                retry_count = shipment.retry_count,
                error = %err.message,
                "Shipment push will not be retried, manual review required"
            );
        } else {
            tracing::warn!(
                tenant_id = %shipment.tenant_id,
                shipment_id = %shipment.id,
                code = %err.code,
                kind = err.kind().name(),
                retry_count = shipment.retry_count,
                next_retry_at = ?shipment.next_retry_at,
                error = %err.message,
                "Shipment push failed"
            );
        }
        Ok(())
    }

    async fn find(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        self.repos
            .shipments
            .find_shipment(tenant_id, shipment_id)
            .await?
            .ok_or_else(|| shipment_not_found(shipment_id))
    }

    async fn find_active(&self, tenant_id: &str, shipment_id: Uuid) -> AppResult<Shipment> {
        let shipment = self.find(tenant_id, shipment_id).await?;
        if !shipment.active {
            return Err(cancelled(shipment_id));
        }
        Ok(shipment)
    }
}

fn shipment_not_found(shipment_id: Uuid) -> AppError {
    AppError::with_message(ErrorCode::ShipmentNotFound, format!("shipment {shipment_id} not found"))
}

fn cancelled(shipment_id: Uuid) -> AppError {
    AppError::with_message(ErrorCode::ShipmentCancelled, format!("shipment {shipment_id} is cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterError;
    use crate::testkit::{TestEngine, raw_order};
    use rust_decimal_macros::dec;
    use shared::models::MarketOrder;

    async fn issued(t: &TestEngine) -> (MarketOrder, Shipment) {
        let order = t
            .insert_order(raw_order("MO-1", 2_000, &[("P1", "S1", dec!(11000))]), dec!(0))
            .await;
        let shipment = t
            .engine
            .shipments
            .issue_invoice(&t.tenant_id, order.id, "CJ", "TRK-1", false)
            .await
            .unwrap();
        (order, shipment)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        assert_eq!(shipment.status, ShipmentStatus::InvoiceIssued);

        let pipeline = &t.engine.shipments;
        let pushed = pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(pushed.status, ShipmentStatus::MarketPushed);
        assert_eq!(pushed.market_push_status, MarketPushStatus::Success);
        assert!(pushed.last_attempted_at.is_some());

        let shipped = pipeline.mark_shipped(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(shipped.status, ShipmentStatus::Shipped);
        let delivered = pipeline.mark_delivered(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(delivered.status, ShipmentStatus::Delivered);

        let pushes = t.marketplace.pushed();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].tracking_number, "TRK-1");
    }

    #[tokio::test]
    async fn test_second_push_after_success_makes_no_call() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        t.engine.shipments.push_to_market(&t.tenant_id, shipment.id).await.unwrap();

        let err = t
            .engine
            .shipments
            .push_to_market(&t.tenant_id, shipment.id)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MarketPushAlreadyCompleted);
        assert_eq!(t.marketplace.push_calls(), 1);
    }

    #[tokio::test]
    async fn test_reissue_needs_override() {
        let t = TestEngine::new().await;
        let (order, shipment) = issued(&t).await;
        let pipeline = &t.engine.shipments;
        pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();

        let err = pipeline
            .issue_invoice(&t.tenant_id, order.id, "CJ", "TRK-2", false)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateTracking);

        let reissued = pipeline
            .issue_invoice(&t.tenant_id, order.id, "CJ", "TRK-2", true)
            .await
            .unwrap();
        assert_eq!(reissued.id, shipment.id);
        assert_eq!(reissued.tracking_number.as_deref(), Some("TRK-2"));
        assert_eq!(reissued.market_push_status, MarketPushStatus::Pending);

        pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(t.marketplace.push_calls(), 2);
    }

    #[tokio::test]
    async fn test_unpushed_tracking_can_be_replaced() {
        let t = TestEngine::new().await;
        let (order, _) = issued(&t).await;
        let replaced = t
            .engine
            .shipments
            .issue_invoice(&t.tenant_id, order.id, "HANJIN", "TRK-9", false)
            .await
            .unwrap();
        assert_eq!(replaced.tracking_number.as_deref(), Some("TRK-9"));
        assert_eq!(replaced.carrier_code.as_deref(), Some("HANJIN"));
    }

    #[tokio::test]
    async fn test_failed_push_retries_until_budget() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        let pipeline = &t.engine.shipments;

        t.marketplace.fail_push(AdapterError::Timeout);
        let failed = pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(failed.status, ShipmentStatus::Failed);
        assert_eq!(failed.market_push_status, MarketPushStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.next_retry_at.is_some());

        // resumes at the push step
        let pushed = pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(pushed.status, ShipmentStatus::MarketPushed);
        assert!(pipeline.list_for_manual_review(&t.tenant_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_shipment_goes_to_manual_review() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        let pipeline = &t.engine.shipments;

        let mut last = shipment.clone();
        for _ in 0..pipeline.max_retries() {
            t.marketplace.fail_push(AdapterError::Network("reset".into()));
            last = pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        }
        assert_eq!(last.retry_count, pipeline.max_retries());
        assert!(last.next_retry_at.is_none());
        let review = pipeline.list_for_manual_review(&t.tenant_id).await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].id, shipment.id);
    }

    #[tokio::test]
    async fn test_fatal_push_failure_not_rescheduled() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        t.marketplace.fail_push(AdapterError::Forbidden("scope".into()));
        let failed = t
            .engine
            .shipments
            .push_to_market(&t.tenant_id, shipment.id)
            .await
            .unwrap();
        assert_eq!(failed.status, ShipmentStatus::Failed);
        assert!(failed.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_fatal_push_failure_goes_to_manual_review() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        let pipeline = &t.engine.shipments;
        t.marketplace.fail_push(AdapterError::Forbidden("scope".into()));
        let failed = pipeline.push_to_market(&t.tenant_id, shipment.id).await.unwrap();
        assert_eq!(failed.retry_count, 1);
        assert!(failed.retry_count < pipeline.max_retries());

        let review = pipeline.list_for_manual_review(&t.tenant_id).await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].id, shipment.id);
    }

    #[tokio::test]
    async fn test_cancelled_shipment_is_skipped() {
        let t = TestEngine::new().await;
        let (_, shipment) = issued(&t).await;
        t.engine.shipments.cancel(&t.tenant_id, shipment.id).await.unwrap();

        let err = t
            .engine
            .shipments
            .push_to_market(&t.tenant_id, shipment.id)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ShipmentCancelled);
        assert_eq!(t.engine.shipments.push_ready(&t.tenant_id, 10).await.unwrap(), 0);
        assert_eq!(t.marketplace.push_calls(), 0);
    }

    #[tokio::test]
    async fn test_invoice_failure_and_illegal_transitions() {
        let t = TestEngine::new().await;
        let order = t
            .insert_order(raw_order("MO-5", 2_000, &[("P1", "S1", dec!(1100))]), dec!(0))
            .await;
        let pipeline = &t.engine.shipments;
        let shipment = pipeline.create_for_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(
            pipeline.create_for_order(&t.tenant_id, order.id).await.unwrap().id,
            shipment.id
        );

        let err = pipeline.mark_shipped(&t.tenant_id, shipment.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidStateTransition);

        pipeline.request_invoice(&t.tenant_id, shipment.id).await.unwrap();
        let failed = pipeline
            .fail_invoice(&t.tenant_id, shipment.id, "carrier down")
            .await
            .unwrap();
        assert_eq!(failed.status, ShipmentStatus::Failed);
        assert_eq!(failed.resume_status(), ShipmentStatus::InvoiceRequested);

        let err = pipeline
            .issue_invoice(&t.tenant_id, order.id, "CJ", "  ", false)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TrackingNumberRequired);

        let issued = pipeline
            .issue_invoice(&t.tenant_id, order.id, "CJ", "TRK-5", false)
            .await
            .unwrap();
        assert_eq!(issued.status, ShipmentStatus::InvoiceIssued);
    }

    #[tokio::test]
    async fn test_push_ready_pushes_issued_shipments() {
        let t = TestEngine::new().await;
        issued(&t).await;
        assert_eq!(t.engine.shipments.push_ready(&t.tenant_id, 10).await.unwrap(), 1);
        assert_eq!(t.engine.shipments.push_ready(&t.tenant_id, 10).await.unwrap(), 0);
    }
}
