//! Settlement reconciliation
//!
//! collect -> validate -> build_postings -> post -> close. A FAILED batch can
//! only restart from collection; nothing resumes half way.

use rust_decimal::Decimal;
use serde_json::json;
use shared::error::{AppError, AppResult, ErrorCode, ErrorKind};
use shared::models::{
    CredentialType, MarketplaceSettlementData, PostingStatus, SettlementBatch, SettlementCycle,
    SettlementPeriod, SettlementStatus,
};
use shared::util::now_millis;
use std::sync::Arc;
use uuid::Uuid;

use super::gateway::{ErpPostingGateway, last_failure_kind};
use super::posting::PostingBuilder;
use super::retry::RetryPolicy;
use crate::adapters::AdapterRegistry;
use crate::audit_log;
use crate::config::Config;
use crate::db::{OrderSettlement, RepoError, Repositories};
use crate::vault::CredentialVault;

pub struct SettlementReconciler {
    repos: Repositories,
    adapters: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    builder: PostingBuilder,
    gateway: Arc<ErpPostingGateway>,
    policy: RetryPolicy,
    tolerance: Decimal,
}

impl SettlementReconciler {
    pub fn new(
        repos: Repositories,
        adapters: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        builder: PostingBuilder,
        gateway: Arc<ErpPostingGateway>,
        config: &Config,
    ) -> Self {
        Self {
            repos,
            adapters,
            vault,
            builder,
            gateway,
            policy: RetryPolicy::from_config(config),
            tolerance: config.settlement_tolerance.abs(),
        }
    }

    /// Ingest the marketplace payout feed for one period
    ///
    /// A FAILED batch for the same period is re-ingested from scratch; any
    /// other existing batch is rejected. Feed failures are recorded on the
    /// returned batch.
    pub async fn collect(
        &self,
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> AppResult<SettlementBatch> {
        let marketplace = marketplace.to_ascii_uppercase();
        self.adapters.marketplace(&marketplace)?;

        let existing = self
            .repos
            .settlements
            .find_settlement_batch_by_period(tenant_id, &marketplace, cycle, period)
            .await?;
        let mut batch = match existing {
            Some(batch) if !batch.active => return Err(cancelled(batch.id)),
            Some(mut batch) if batch.status == SettlementStatus::Failed => {
                batch.transition(SettlementStatus::Collected, now_millis())?;
                batch.last_error = None;
                self.repos.settlements.update_settlement_batch(&batch).await?;
                batch
            }
            Some(batch) => {
                return Err(AppError::with_message(
                    ErrorCode::SettlementAlreadyCollected,
                    format!("settlement {} {} already collected", cycle, period.label()),
                )
                .with_detail("batch_id", batch.id.to_string())
                .with_detail("status", batch.status.as_str()));
            }
            None => {
                let batch = SettlementBatch::new(tenant_id, &marketplace, cycle, period);
                match self.repos.settlements.insert_settlement_batch(&batch).await {
                    Ok(()) => batch,
                    Err(RepoError::Duplicate(_)) => {
                        return Err(AppError::with_message(
                            ErrorCode::SettlementAlreadyCollected,
                            format!("settlement {} {} already collected", cycle, period.label()),
                        ));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let data = match self.fetch(&batch).await {
            Ok(data) => data,
            Err(e) => {
                self.fail(&mut batch, &e).await?;
                return Ok(batch);
            }
        };

        // declared figures land first so an interrupted match cannot validate
        batch.load_declared(&data);
        batch.updated_at = now_millis();
        self.repos.settlements.update_settlement_batch(&batch).await?;
        if let Err(e) = self.match_lines(&mut batch, &data).await {
            self.fail(&mut batch, &e).await?;
            return Ok(batch);
        }
        batch.updated_at = now_millis();
        self.repos.settlements.update_settlement_batch(&batch).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            batch_id = %batch.id,
            marketplace = %marketplace,
            period = %period.label(),
            matched = batch.matched_count,
            unmatched = batch.unmatched_count,
            "Settlement collected"
        );
        Ok(batch)
    }

    async fn match_lines(
        &self,
        batch: &mut SettlementBatch,
        data: &MarketplaceSettlementData,
    ) -> AppResult<()> {
        for line in &data.lines {
            let order = self
                .repos
                .orders
                .find_order_by_marketplace_id(
                    &batch.tenant_id,
                    &batch.marketplace,
                    &line.marketplace_order_id,
                )
                .await?;
            match order {
                Some(order) => {
                    batch.record_match(order.total_amount - order.shipping_fee, line);
                    self.repos
                        .orders
                        .update_order_settlement(
                            &batch.tenant_id,
                            order.id,
                            OrderSettlement {
                                commission: line.commission,
                                pg_fee: line.pg_fee,
                                shipping_settled: line.shipping_settled,
                                batch_id: batch.id,
                            },
                        )
                        .await?;
                }
                None => batch.record_unmatched(&line.marketplace_order_id),
            }
        }
        Ok(())
    }

    /// COLLECTED -> VALIDATED when matched figures agree with the declared
    /// ones within tolerance; otherwise FAILED with the discrepancy attached
    pub async fn validate(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let mut batch = self.find_active(tenant_id, batch_id).await?;
        expect_status(&batch, SettlementStatus::Collected)?;

        let checks = [
            ("gross_sales", batch.gross_sales, batch.matched_gross_sales),
            ("commission", batch.commission, batch.matched_commission),
            ("pg_fee", batch.pg_fee, batch.matched_pg_fee),
            ("payout", batch.actual_payout, batch.expected_payout),
            ("net_payout", batch.actual_payout, batch.net_payout),
        ];
        let mut discrepancy = serde_json::Map::new();
        for (field, declared, computed) in checks {
            let difference = declared - computed;
            if difference.abs() > self.tolerance {
                discrepancy.insert(
                    field.to_string(),
                    json!({
                        "declared": declared.to_string(),
                        "computed": computed.to_string(),
                        "difference": difference.to_string(),
                    }),
                );
            }
        }

        if discrepancy.is_empty() {
            batch.transition(SettlementStatus::Validated, now_millis())?;
            self.repos.settlements.update_settlement_batch(&batch).await?;
            tracing::info!(tenant_id = %tenant_id, batch_id = %batch_id, "Settlement validated");
            return Ok(batch);
        }

        if !batch.unmatched_order_ids.is_empty() {
            discrepancy.insert("unmatched_order_ids".into(), json!(batch.unmatched_order_ids));
        }
        let fields: Vec<&str> = discrepancy
            .keys()
            .filter(|k| *k != "unmatched_order_ids")
            .map(String::as_str)
            .collect();
        let err = AppError::with_message(
            ErrorCode::SettlementMismatch,
            format!("settlement totals outside tolerance: {}", fields.join(", ")),
        );
        batch.discrepancy = Some(serde_json::Value::Object(discrepancy));
        self.fail(&mut batch, &err).await?;
        Ok(batch)
    }

    /// VALIDATED -> POSTING_READY once every settlement document is registered
    pub async fn build_postings(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let mut batch = self.find_active(tenant_id, batch_id).await?;
        expect_status(&batch, SettlementStatus::Validated)?;

        let documents = self.builder.build_settlement_documents(&batch);
        let count = documents.len();
        for document in documents {
            self.gateway.register(document).await?;
        }
        batch.transition(SettlementStatus::PostingReady, now_millis())?;
        self.repos.settlements.update_settlement_batch(&batch).await?;
        tracing::info!(tenant_id = %tenant_id, batch_id = %batch_id, documents = count, "Settlement postings built");
        Ok(batch)
    }

    /// Submit the batch's postings
    ///
    /// All POSTED -> batch POSTED. A posting that failed fatally, or ran out
    /// of retries, fails the batch. Otherwise the batch stays POSTING_READY
    /// with a retry time.
    pub async fn post(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let mut batch = self.find_active(tenant_id, batch_id).await?;
        expect_status(&batch, SettlementStatus::PostingReady)?;

        let mut pending = 0usize;
        let mut fatal: Option<AppError> = None;
        for posting in self.gateway.postings_for(tenant_id, batch.id).await? {
            let result = match posting.status {
                PostingStatus::Posted => continue,
                PostingStatus::ReadyToPost => self.gateway.submit(tenant_id, posting.id).await,
                PostingStatus::Failed
                    if last_failure_kind(&posting) == Some(ErrorKind::Retryable)
                        && posting.next_retry_at.is_some() =>
                {
                    self.gateway.resubmit(tenant_id, posting.id).await
                }
                _ => Ok(posting),
            };
            let posting = match result {
                Ok(posting) => posting,
                Err(e) if e.code == ErrorCode::PostingInFlight => {
                    pending += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match posting.status {
                PostingStatus::Posted => {}
                PostingStatus::Failed
                    if last_failure_kind(&posting) != Some(ErrorKind::Retryable)
                        || posting.next_retry_at.is_none() =>
                {
                    fatal.get_or_insert_with(|| {
                        AppError::with_message(
                            ErrorCode::RetryBudgetExhausted,
                            format!(
                                "{} posting failed: {}",
                                posting.posting_type,
                                posting.last_error.clone().unwrap_or_default()
                            ),
                        )
                    });
                }
                _ => pending += 1,
            }
        }

        let now = now_millis();
        if let Some(err) = fatal {
            self.fail(&mut batch, &err).await?;
        } else if pending == 0 {
            batch.last_error = None;
            batch.transition(SettlementStatus::Posted, now)?;
            self.repos.settlements.update_settlement_batch(&batch).await?;
            tracing::info!(tenant_id = %tenant_id, batch_id = %batch_id, "Settlement POSTED");
        } else {
            batch.attempt_count += 1;
            batch.last_error = Some(format!("{pending} postings awaiting retry"));
            batch.next_retry_at = self.policy.next_retry_at(batch.attempt_count as u32, now);
            batch.updated_at = now;
            self.repos.settlements.update_settlement_batch(&batch).await?;
            tracing::warn!(
                tenant_id = %tenant_id,
                batch_id = %batch_id,
                pending,
                next_retry_at = ?batch.next_retry_at,
                "Settlement postings incomplete"
            );
        }
        Ok(batch)
    }

    /// POSTED -> CLOSED
    pub async fn close(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let mut batch = self.find(tenant_id, batch_id).await?;
        batch.transition(SettlementStatus::Closed, now_millis())?;
        self.repos.settlements.update_settlement_batch(&batch).await?;
        audit_log!(tenant_id, "settlement_close", batch_id.to_string().as_str(), batch.period().label().as_str());
        Ok(batch)
    }

    /// collect -> validate -> build_postings -> post, stopping at the first
    /// step that does not advance the batch
    pub async fn run_cycle(
        &self,
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> AppResult<SettlementBatch> {
        let batch = self.collect(tenant_id, marketplace, cycle, period).await?;
        self.advance_from(batch).await
    }

    /// Pick a due batch back up: FAILED restarts at collection, POSTING_READY
    /// re-posts
    pub async fn retry_batch(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let batch = self.find_active(tenant_id, batch_id).await?;
        match batch.status {
            SettlementStatus::Failed => {
                self.run_cycle(tenant_id, &batch.marketplace, batch.cycle, batch.period())
                    .await
            }
            SettlementStatus::PostingReady => self.post(tenant_id, batch_id).await,
            _ => Ok(batch),
        }
    }

    pub async fn cancel(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let mut batch = self.find(tenant_id, batch_id).await?;
        batch.active = false;
        batch.next_retry_at = None;
        batch.updated_at = now_millis();
        self.repos.settlements.update_settlement_batch(&batch).await?;
        audit_log!(tenant_id, "settlement_cancel", batch_id.to_string().as_str());
        Ok(batch)
    }

    async fn advance_from(&self, mut batch: SettlementBatch) -> AppResult<SettlementBatch> {
        let tenant_id = batch.tenant_id.clone();
        if batch.status == SettlementStatus::Collected {
            batch = self.validate(&tenant_id, batch.id).await?;
        }
        if batch.status == SettlementStatus::Validated {
            batch = self.build_postings(&tenant_id, batch.id).await?;
        }
        if batch.status == SettlementStatus::PostingReady {
            batch = self.post(&tenant_id, batch.id).await?;
        }
        Ok(batch)
    }

    async fn fetch(&self, batch: &SettlementBatch) -> AppResult<MarketplaceSettlementData> {
        let adapter = self.adapters.marketplace(&batch.marketplace)?;
        let credentials = self
            .vault
            .load(
                &batch.tenant_id,
                None,
                CredentialType::Marketplace,
                adapter.credential_keys(),
            )
            .await?;
        Ok(adapter
            .fetch_settlement(&credentials, batch.cycle, batch.period())
            .await?)
    }

    async fn fail(&self, batch: &mut SettlementBatch, err: &AppError) -> AppResult<()> {
        let now = now_millis();
        batch.transition(SettlementStatus::Failed, now)?;
        batch.last_error = Some(err.message.clone());
        batch.next_retry_at = if err.is_retryable() {
            self.policy.next_retry_at(batch.attempt_count as u32, now)
        } else {
            None
        };
        self.repos.settlements.update_settlement_batch(batch).await?;
        tracing::warn!(
            tenant_id = %batch.tenant_id,
            batch_id = %batch.id,
            code = %err.code,
            kind = err.kind().name(),
            attempt = batch.attempt_count,
            next_retry_at = ?batch.next_retry_at,
            error = %err.message,
            "Settlement FAILED"
        );
        Ok(())
    }

    async fn find(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        self.repos
            .settlements
            .find_settlement_batch(tenant_id, batch_id)
            .await?
            .ok_or_else(|| {
                AppError::with_message(
                    ErrorCode::SettlementBatchNotFound,
                    format!("settlement batch {batch_id} not found"),
                )
            })
    }

    async fn find_active(&self, tenant_id: &str, batch_id: Uuid) -> AppResult<SettlementBatch> {
        let batch = self.find(tenant_id, batch_id).await?;
        if !batch.active {
            return Err(cancelled(batch_id));
        }
        Ok(batch)
    }
}

fn expect_status(batch: &SettlementBatch, expected: SettlementStatus) -> AppResult<()> {
    if batch.status == expected {
        return Ok(());
    }
    Err(AppError::with_message(
        ErrorCode::InvalidStateTransition,
        format!("settlement batch {} is {}, expected {}", batch.id, batch.status, expected),
    ))
}

fn cancelled(batch_id: Uuid) -> AppError {
    AppError::with_message(
        ErrorCode::SettlementCancelled,
        format!("settlement batch {batch_id} is cancelled"),
    )
}
