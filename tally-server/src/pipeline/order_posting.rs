//! Order -> ERP posting flow
//!
//! Resolves mappings, builds the order's documents, and hands them to the
//! gateway. The order's `posting_status` summarises its postings.

use futures::StreamExt;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{
    CredentialType, MarketOrder, OrderPostingStatus, Posting, PostingSource, PostingStatus,
    PostingType,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::gateway::ErpPostingGateway;
use super::mapping::{ProductMappingResolver, item_scope};
use super::posting::PostingBuilder;
use crate::adapters::AdapterRegistry;
use crate::db::Repositories;
use crate::vault::CredentialVault;

/// Result of one `post_order` call
#[derive(Debug, Clone)]
pub struct OrderPostingReport {
    pub order_id: Uuid,
    pub status: OrderPostingStatus,
    pub postings: Vec<Posting>,
    /// `productId:sku` keys still lacking a MAPPED mapping
    pub unmapped: Vec<String>,
}

pub struct OrderPostingService {
    repos: Repositories,
    adapters: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    resolver: Arc<ProductMappingResolver>,
    builder: PostingBuilder,
    gateway: Arc<ErpPostingGateway>,
    concurrency: usize,
}

impl OrderPostingService {
    pub fn new(
        repos: Repositories,
        adapters: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        resolver: Arc<ProductMappingResolver>,
        builder: PostingBuilder,
        gateway: Arc<ErpPostingGateway>,
        concurrency: usize,
    ) -> Self {
        Self {
            repos,
            adapters,
            vault,
            resolver,
            builder,
            gateway,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn post_order(&self, tenant_id: &str, order_id: Uuid) -> AppResult<OrderPostingReport> {
        let order = self
            .repos
            .orders
            .find_order(tenant_id, order_id)
            .await?
            .ok_or_else(|| {
                AppError::with_message(ErrorCode::OrderNotFound, format!("order {order_id} not found"))
            })?;

        if order.posting_status == OrderPostingStatus::Posted {
            return Ok(OrderPostingReport {
                order_id,
                status: OrderPostingStatus::Posted,
                postings: self.gateway.postings_for(tenant_id, order_id).await?,
                unmapped: Vec::new(),
            });
        }

        let mappings = match self
            .resolver
            .require_mapped(tenant_id, Some(order.store_id), &order.marketplace, &order.items)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) if e.code == ErrorCode::MappingRequired => {
                return self.hold_for_mapping(&order, e.unmapped_keys()).await;
            }
            Err(e) => return Err(e),
        };

        let documents = self.builder.build_order_documents(&order, &mappings)?;
        let mut postings = Vec::with_capacity(documents.len());
        for document in documents {
            let posting = self.gateway.register(document).await?;
            if posting.status != PostingStatus::ReadyToPost {
                postings.push(posting);
                continue;
            }
            match self.gateway.submit(tenant_id, posting.id).await {
                Ok(submitted) => postings.push(submitted),
                Err(e) if e.code == ErrorCode::PostingInFlight => postings.push(posting),
                Err(e) => return Err(e),
            }
        }

        let (status, error) = summarise(&postings);
        self.repos
            .orders
            .update_order_posting(tenant_id, order_id, status, error.as_deref())
            .await?;
        tracing::info!(
            tenant_id = %tenant_id,
            order_id = %order_id,
            marketplace_order_id = %order.marketplace_order_id,
            status = %status,
            documents = postings.len(),
            "Order posting processed"
        );
        Ok(OrderPostingReport {
            order_id,
            status,
            postings,
            unmapped: Vec::new(),
        })
    }

    /// Post every NOT_POSTED / PENDING_MAPPING order of a tenant. Returns how
    /// many orders ended up POSTED.
    pub async fn post_pending(&self, tenant_id: &str, limit: i64) -> AppResult<usize> {
        let orders = self.repos.orders.list_orders_for_posting(tenant_id, limit).await?;
        let posted = AtomicUsize::new(0);
        futures::stream::iter(orders)
            .for_each_concurrent(self.concurrency, |order| {
                let posted = &posted;
                async move {
                    match self.post_order(tenant_id, order.id).await {
                        Ok(report) if report.status == OrderPostingStatus::Posted => {
                            posted.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(
                            tenant_id = %tenant_id,
                            order_id = %order.id,
                            code = %e.code,
                            error = %e.message,
                            "Order posting failed"
                        ),
                    }
                }
            })
            .await;
        Ok(posted.into_inner())
    }

    async fn hold_for_mapping(
        &self,
        order: &MarketOrder,
        unmapped: Vec<String>,
    ) -> AppResult<OrderPostingReport> {
        self.suggest_for(order, &unmapped).await;

        let mut types = Vec::with_capacity(2);
        if order.active_items().next().is_some() {
            types.push(PostingType::Sales);
        }
        if order.cancelled_items().next().is_some() {
            types.push(PostingType::Cancel);
        }
        let mut postings = Vec::with_capacity(types.len());
        for posting_type in types {
            postings.push(
                self.gateway
                    .mark_pending_mapping(
                        &order.tenant_id,
                        PostingSource::Order,
                        order.id,
                        posting_type,
                        &unmapped,
                    )
                    .await?,
            );
        }

        let reason = format!("unmapped items: {}", unmapped.join(", "));
        self.repos
            .orders
            .update_order_posting(
                &order.tenant_id,
                order.id,
                OrderPostingStatus::PendingMapping,
                Some(&reason),
            )
            .await?;
        tracing::info!(
            tenant_id = %order.tenant_id,
            order_id = %order.id,
            unmapped = ?unmapped,
            "Order held for product mapping"
        );
        Ok(OrderPostingReport {
            order_id: order.id,
            status: OrderPostingStatus::PendingMapping,
            postings,
            unmapped,
        })
    }

    /// Best effort: a failing ERP catalogue lookup only costs the suggestion
    async fn suggest_for(&self, order: &MarketOrder, unmapped: &[String]) {
        let catalogue = async {
            let erp = self.adapters.erp()?;
            let credentials = self
                .vault
                .load(&order.tenant_id, None, CredentialType::Erp, erp.credential_keys())
                .await?;
            Ok::<_, AppError>(erp.get_items(&credentials).await?)
        };
        let items = match catalogue.await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %order.tenant_id,
                    code = %e.code,
                    error = %e.message,
                    "ERP item catalogue unavailable, no suggestions made"
                );
                return;
            }
        };

        for item in &order.items {
            if !unmapped.contains(&item.mapping_key()) {
                continue;
            }
            let scope = item_scope(&order.tenant_id, Some(order.store_id), &order.marketplace, item);
            if let Err(e) = self.resolver.suggest(&scope, &item.name, &items).await {
                tracing::warn!(key = %scope.key(), error = %e, "Mapping suggestion failed");
            }
        }
    }
}

fn summarise(postings: &[Posting]) -> (OrderPostingStatus, Option<String>) {
    if postings.iter().all(Posting::is_posted) {
        return (OrderPostingStatus::Posted, None);
    }
    if let Some(failed) = postings.iter().find(|p| p.status == PostingStatus::Failed) {
        return (OrderPostingStatus::Failed, failed.last_error.clone());
    }
    (OrderPostingStatus::NotPosted, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, ErpItem};
    use crate::testkit::{TestEngine, raw_order};
    use rust_decimal_macros::dec;
    use shared::models::{ErpItemRef, MappingStatus};

    #[tokio::test]
    async fn test_mapped_order_posts_each_document_once() {
        let t = TestEngine::new().await;
        t.map("P1", "S1", "ERP-001").await;
        let order = t
            .insert_order(raw_order("MO-1", 2_000, &[("P1", "S1", dec!(11000))]), dec!(3000))
            .await;

        let report = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(report.status, OrderPostingStatus::Posted);
        assert_eq!(report.postings.len(), 2);
        assert_eq!(t.erp.post_calls(), 2);

        let sales = t
            .erp
            .posted_documents()
            .into_iter()
            .find(|d| d.posting_type == PostingType::Sales)
            .unwrap();
        assert_eq!(sales.totals.supply_amount, dec!(10000));
        assert_eq!(sales.totals.vat_amount, dec!(1000));

        // posting again is a no-op
        let again = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(again.status, OrderPostingStatus::Posted);
        assert_eq!(t.erp.post_calls(), 2);
    }

    #[tokio::test]
    async fn test_unmapped_order_waits_and_gets_suggestion() {
        let t = TestEngine::new().await;
        t.erp.set_items(vec![ErpItem {
            item_code: "ERP-CUP".into(),
            item_name: "P2 name".into(),
            warehouse_code: None,
            sku: None,
        }]);
        t.map("P1", "S1", "ERP-001").await;
        let order = t
            .insert_order(
                raw_order("MO-2", 2_000, &[("P1", "S1", dec!(1100)), ("P2", "S2", dec!(2200))]),
                dec!(0),
            )
            .await;

        let report = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(report.status, OrderPostingStatus::PendingMapping);
        assert_eq!(report.unmapped, vec!["P2:S2".to_string()]);
        assert_eq!(report.postings[0].status, PostingStatus::PendingMapping);
        assert_eq!(t.erp.post_calls(), 0);

        let suggestions = t
            .engine
            .resolver
            .list(&t.tenant_id, Some(MappingStatus::Suggested))
            .await
            .unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].erp_item_code.as_deref(), Some("ERP-CUP"));

        // a suggestion alone does not unblock posting
        let still = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(still.status, OrderPostingStatus::PendingMapping);

        t.engine
            .resolver
            .confirm_suggestion(&t.tenant_id, suggestions[0].id)
            .await
            .unwrap();
        let done = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(done.status, OrderPostingStatus::Posted);
        assert_eq!(done.postings[0].id, report.postings[0].id);
    }

    #[tokio::test]
    async fn test_fatal_erp_failure_marks_order_failed() {
        let t = TestEngine::new().await;
        t.erp.fail_post(AdapterError::MalformedPayload("bad vat".into()));
        t.map("P1", "S1", "ERP-001").await;
        let order = t
            .insert_order(raw_order("MO-3", 2_000, &[("P1", "S1", dec!(5500))]), dec!(0))
            .await;

        let report = t.engine.order_posting.post_order(&t.tenant_id, order.id).await.unwrap();
        assert_eq!(report.status, OrderPostingStatus::Failed);
        let stored = t
            .engine
            .repos
            .orders
            .find_order(&t.tenant_id, order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.posting_status, OrderPostingStatus::Failed);
        assert!(stored.posting_error.unwrap().contains("bad vat"));
    }

    #[tokio::test]
    async fn test_post_pending_sweeps_tenant_orders() {
        let t = TestEngine::new().await;
        t.engine
            .resolver
            .set_manual_mapping(
                &t.scope(None, "P1", "S1"),
                ErpItemRef {
                    item_code: "ERP-001".into(),
                    item_name: None,
                    warehouse_code: None,
                },
            )
            .await
            .unwrap();
        for id in ["MO-1", "MO-2", "MO-3"] {
            t.insert_order(raw_order(id, 2_000, &[("P1", "S1", dec!(1100))]), dec!(0))
                .await;
        }
        let posted = t.engine.order_posting.post_pending(&t.tenant_id, 10).await.unwrap();
        assert_eq!(posted, 3);
        assert_eq!(t.engine.order_posting.post_pending(&t.tenant_id, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let t = TestEngine::new().await;
        let err = t
            .engine
            .order_posting
            .post_order(&t.tenant_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OrderNotFound);
    }
}
