//! In-memory repositories
//!
//! Same contracts as the PostgreSQL backend, including the unique
//! constraints, so pipelines behave identically under test.

use async_trait::async_trait;
use parking_lot::RwLock;
use shared::models::{
    CredentialKey, MappingScope, MappingStatus, MarketOrder, OrderPostingStatus, Posting,
    PostingStatus, ProductMapping, SettlementBatch, SettlementCycle, SettlementPeriod, Shipment,
    ShipmentStatus, Store, StoredCredential, SyncJob,
};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    CredentialRepository, MappingRepository, OrderRepository, OrderSettlement, PostingRepository,
    RepoError, RepoResult, SettlementRepository, ShipmentRepository, StoreRepository,
    SyncJobRepository, UpsertOutcome,
};

#[derive(Default)]
pub struct InMemoryRepository {
    stores: RwLock<HashMap<Uuid, Store>>,
    sync_jobs: RwLock<HashMap<Uuid, SyncJob>>,
    orders: RwLock<HashMap<Uuid, MarketOrder>>,
    mappings: RwLock<HashMap<Uuid, ProductMapping>>,
    postings: RwLock<HashMap<Uuid, Posting>>,
    shipments: RwLock<HashMap<Uuid, Shipment>>,
    settlements: RwLock<HashMap<Uuid, SettlementBatch>>,
    credentials: RwLock<HashMap<CredentialKey, StoredCredential>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn limited<T>(mut items: Vec<T>, limit: i64) -> Vec<T> {
    items.truncate(limit.max(0) as usize);
    items
}

#[async_trait]
impl StoreRepository for InMemoryRepository {
    async fn insert_store(&self, store: &Store) -> RepoResult<()> {
        let mut stores = self.stores.write();
        if stores.contains_key(&store.id) {
            return Err(RepoError::Duplicate(format!("store {}", store.id)));
        }
        stores.insert(store.id, store.clone());
        Ok(())
    }

    async fn find_store(&self, tenant_id: &str, store_id: Uuid) -> RepoResult<Option<Store>> {
        Ok(self
            .stores
            .read()
            .get(&store_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_active_stores(&self) -> RepoResult<Vec<Store>> {
        let mut stores: Vec<Store> = self
            .stores
            .read()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        stores.sort_by_key(|s| s.created_at);
        Ok(stores)
    }

    async fn set_store_active(
        &self,
        tenant_id: &str,
        store_id: Uuid,
        active: bool,
    ) -> RepoResult<()> {
        let mut stores = self.stores.write();
        let store = stores
            .get_mut(&store_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| RepoError::NotFound(format!("store {store_id}")))?;
        store.active = active;
        Ok(())
    }

    async fn mark_store_synced(&self, tenant_id: &str, store_id: Uuid, until: i64) -> RepoResult<()> {
        let mut stores = self.stores.write();
        let store = stores
            .get_mut(&store_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| RepoError::NotFound(format!("store {store_id}")))?;
        store.last_synced_at = Some(store.last_synced_at.map_or(until, |prev| prev.max(until)));
        Ok(())
    }
}

#[async_trait]
impl SyncJobRepository for InMemoryRepository {
    async fn insert_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
        let mut jobs = self.sync_jobs.write();
        let conflict = jobs.values().any(|j| {
            j.tenant_id == job.tenant_id && j.store_id == job.store_id && j.status.is_in_flight()
        });
        if conflict && job.status.is_in_flight() {
            return Err(RepoError::Duplicate(format!(
                "store {} already has an active sync job",
                job.store_id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_sync_job(&self, job: &SyncJob) -> RepoResult<()> {
        let mut jobs = self.sync_jobs.write();
        if job.status.is_in_flight() {
            let conflict = jobs.values().any(|j| {
                j.id != job.id
                    && j.tenant_id == job.tenant_id
                    && j.store_id == job.store_id
                    && j.status.is_in_flight()
            });
            if conflict {
                return Err(RepoError::Duplicate(format!(
                    "store {} already has an active sync job",
                    job.store_id
                )));
            }
        }
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.tenant_id == job.tenant_id => {
                *existing = job.clone();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("sync job {}", job.id))),
        }
    }

    async fn find_sync_job(&self, tenant_id: &str, job_id: Uuid) -> RepoResult<Option<SyncJob>> {
        Ok(self
            .sync_jobs
            .read()
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_in_flight_job(
        &self,
        tenant_id: &str,
        store_id: Uuid,
    ) -> RepoResult<Option<SyncJob>> {
        Ok(self
            .sync_jobs
            .read()
            .values()
            .find(|j| j.tenant_id == tenant_id && j.store_id == store_id && j.status.is_in_flight())
            .cloned())
    }

    async fn list_due_sync_jobs(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<SyncJob>> {
        let mut due: Vec<SyncJob> = self
            .sync_jobs
            .read()
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.is_retry_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_retry_at);
        Ok(limited(due, limit))
    }
}

#[async_trait]
impl OrderRepository for InMemoryRepository {
    async fn upsert_order(&self, order: &MarketOrder) -> RepoResult<UpsertOutcome> {
        let mut orders = self.orders.write();
        let existing = orders.values_mut().find(|o| {
            o.tenant_id == order.tenant_id
                && o.store_id == order.store_id
                && o.marketplace == order.marketplace
                && o.marketplace_order_id == order.marketplace_order_id
        });
        match existing {
            Some(o) => {
                o.ordered_at = order.ordered_at;
                o.buyer_name = order.buyer_name.clone();
                o.shipping_fee = order.shipping_fee;
                o.total_amount = order.total_amount;
                o.items = order.items.clone();
                o.updated_at = order.updated_at;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                orders.insert(order.id, order.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn find_order(&self, tenant_id: &str, order_id: Uuid) -> RepoResult<Option<MarketOrder>> {
        Ok(self
            .orders
            .read()
            .get(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_order_by_marketplace_id(
        &self,
        tenant_id: &str,
        marketplace: &str,
        marketplace_order_id: &str,
    ) -> RepoResult<Option<MarketOrder>> {
        Ok(self
            .orders
            .read()
            .values()
            .find(|o| {
                o.tenant_id == tenant_id
                    && o.marketplace == marketplace
                    && o.marketplace_order_id == marketplace_order_id
            })
            .cloned())
    }

    async fn update_order_posting(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        status: OrderPostingStatus,
        error: Option<&str>,
    ) -> RepoResult<()> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .ok_or_else(|| RepoError::NotFound(format!("order {order_id}")))?;
        order.posting_status = status;
        order.posting_error = error.map(str::to_string);
        Ok(())
    }

    async fn update_order_settlement(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        settlement: OrderSettlement,
    ) -> RepoResult<()> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .ok_or_else(|| RepoError::NotFound(format!("order {order_id}")))?;
        order.commission = Some(settlement.commission);
        order.pg_fee = Some(settlement.pg_fee);
        order.shipping_settled = Some(settlement.shipping_settled);
        order.settlement_batch_id = Some(settlement.batch_id);
        Ok(())
    }

    async fn list_orders_for_posting(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> RepoResult<Vec<MarketOrder>> {
        let mut pending: Vec<MarketOrder> = self
            .orders
            .read()
            .values()
            .filter(|o| {
                o.tenant_id == tenant_id
                    && matches!(
                        o.posting_status,
                        OrderPostingStatus::NotPosted | OrderPostingStatus::PendingMapping
                    )
            })
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.ordered_at);
        Ok(limited(pending, limit))
    }
}

#[async_trait]
impl MappingRepository for InMemoryRepository {
    async fn find_active_mapping(
        &self,
        scope: &MappingScope,
    ) -> RepoResult<Option<ProductMapping>> {
        Ok(self
            .mappings
            .read()
            .values()
            .find(|m| m.active && m.scope() == *scope)
            .cloned())
    }

    async fn find_mapping(
        &self,
        tenant_id: &str,
        mapping_id: Uuid,
    ) -> RepoResult<Option<ProductMapping>> {
        Ok(self
            .mappings
            .read()
            .get(&mapping_id)
            .filter(|m| m.tenant_id == tenant_id)
            .cloned())
    }

    async fn replace_active_mapping(&self, mapping: &ProductMapping) -> RepoResult<()> {
        let scope = mapping.scope();
        let mut mappings = self.mappings.write();
        for existing in mappings.values_mut() {
            if existing.id != mapping.id && existing.active && existing.scope() == scope {
                existing.active = false;
                existing.updated_at = mapping.updated_at;
            }
        }
        mappings.insert(mapping.id, mapping.clone());
        Ok(())
    }

    async fn update_mapping(&self, mapping: &ProductMapping) -> RepoResult<()> {
        let mut mappings = self.mappings.write();
        match mappings.get_mut(&mapping.id) {
            Some(existing) if existing.tenant_id == mapping.tenant_id => {
                *existing = mapping.clone();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("mapping {}", mapping.id))),
        }
    }

    async fn list_mappings(
        &self,
        tenant_id: &str,
        status: Option<MappingStatus>,
    ) -> RepoResult<Vec<ProductMapping>> {
        let mut found: Vec<ProductMapping> = self
            .mappings
            .read()
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.active)
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(found)
    }
}

#[async_trait]
impl PostingRepository for InMemoryRepository {
    async fn insert_posting(&self, posting: &Posting) -> RepoResult<()> {
        let mut postings = self.postings.write();
        let conflict = postings.values().any(|p| {
            p.tenant_id == posting.tenant_id && p.idempotency_key == posting.idempotency_key
        });
        if conflict {
            return Err(RepoError::Duplicate(format!(
                "posting {}",
                posting.idempotency_key
            )));
        }
        postings.insert(posting.id, posting.clone());
        Ok(())
    }

    async fn update_posting(&self, posting: &Posting) -> RepoResult<()> {
        let mut postings = self.postings.write();
        match postings.get_mut(&posting.id) {
            Some(existing) if existing.tenant_id == posting.tenant_id => {
                *existing = posting.clone();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("posting {}", posting.id))),
        }
    }

    async fn update_posting_if_status(
        &self,
        posting: &Posting,
        expected: PostingStatus,
    ) -> RepoResult<bool> {
        let mut postings = self.postings.write();
        match postings.get_mut(&posting.id) {
            Some(existing) if existing.tenant_id == posting.tenant_id => {
                if existing.status != expected {
                    return Ok(false);
                }
                *existing = posting.clone();
                Ok(true)
            }
            _ => Err(RepoError::NotFound(format!("posting {}", posting.id))),
        }
    }

    async fn find_posting(&self, tenant_id: &str, posting_id: Uuid) -> RepoResult<Option<Posting>> {
        Ok(self
            .postings
            .read()
            .get(&posting_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_posting_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> RepoResult<Option<Posting>> {
        Ok(self
            .postings
            .read()
            .values()
            .find(|p| p.tenant_id == tenant_id && p.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn try_claim_posting(
        &self,
        tenant_id: &str,
        posting_id: Uuid,
        now: i64,
    ) -> RepoResult<Option<Posting>> {
        let mut postings = self.postings.write();
        let Some(posting) = postings
            .get_mut(&posting_id)
            .filter(|p| p.tenant_id == tenant_id)
        else {
            return Err(RepoError::NotFound(format!("posting {posting_id}")));
        };
        if posting.status != PostingStatus::ReadyToPost {
            return Ok(None);
        }
        posting
            .transition(PostingStatus::PostingRequested, now)
            .map_err(|e| RepoError::Validation(e.to_string()))?;
        Ok(Some(posting.clone()))
    }

    async fn list_postings_for_reference(
        &self,
        tenant_id: &str,
        reference_id: Uuid,
    ) -> RepoResult<Vec<Posting>> {
        let mut found: Vec<Posting> = self
            .postings
            .read()
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.reference_id == reference_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.posting_type);
        Ok(found)
    }

    async fn list_due_postings(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<Posting>> {
        let mut due: Vec<Posting> = self
            .postings
            .read()
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.is_retry_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.next_retry_at);
        Ok(limited(due, limit))
    }

    async fn list_stale_claims(
        &self,
        tenant_id: &str,
        claimed_before: i64,
    ) -> RepoResult<Vec<Posting>> {
        Ok(self
            .postings
            .read()
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.status == PostingStatus::PostingRequested
                    && p.requested_at.is_some_and(|at| at < claimed_before)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ShipmentRepository for InMemoryRepository {
    async fn insert_shipment(&self, shipment: &Shipment) -> RepoResult<()> {
        let mut shipments = self.shipments.write();
        let conflict = shipments
            .values()
            .any(|s| s.tenant_id == shipment.tenant_id && s.order_id == shipment.order_id);
        if conflict {
            return Err(RepoError::Duplicate(format!(
                "shipment for order {}",
                shipment.order_id
            )));
        }
        shipments.insert(shipment.id, shipment.clone());
        Ok(())
    }

    async fn update_shipment(&self, shipment: &Shipment) -> RepoResult<()> {
        let mut shipments = self.shipments.write();
        match shipments.get_mut(&shipment.id) {
            Some(existing) if existing.tenant_id == shipment.tenant_id => {
                *existing = shipment.clone();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("shipment {}", shipment.id))),
        }
    }

    async fn find_shipment(
        &self,
        tenant_id: &str,
        shipment_id: Uuid,
    ) -> RepoResult<Option<Shipment>> {
        Ok(self
            .shipments
            .read()
            .get(&shipment_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_shipment_by_order(
        &self,
        tenant_id: &str,
        order_id: Uuid,
    ) -> RepoResult<Option<Shipment>> {
        Ok(self
            .shipments
            .read()
            .values()
            .find(|s| s.tenant_id == tenant_id && s.order_id == order_id)
            .cloned())
    }

    async fn list_shipments_by_status(
        &self,
        tenant_id: &str,
        status: ShipmentStatus,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>> {
        let mut found: Vec<Shipment> = self
            .shipments
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.active && s.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.updated_at);
        Ok(limited(found, limit))
    }

    async fn list_due_shipments(
        &self,
        tenant_id: &str,
        now: i64,
        max_retries: i32,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>> {
        let mut due: Vec<Shipment> = self
            .shipments
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_retry_due(now, max_retries))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_retry_at);
        Ok(limited(due, limit))
    }

    async fn list_shipments_for_review(
        &self,
        tenant_id: &str,
        max_retries: i32,
    ) -> RepoResult<Vec<Shipment>> {
        let mut found: Vec<Shipment> = self
            .shipments
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.needs_manual_review(max_retries))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.last_attempted_at);
        Ok(found)
    }
}

#[async_trait]
impl SettlementRepository for InMemoryRepository {
    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()> {
        let mut batches = self.settlements.write();
        let conflict = batches.values().any(|b| {
            b.tenant_id == batch.tenant_id
                && b.marketplace == batch.marketplace
                && b.cycle == batch.cycle
                && b.period() == batch.period()
        });
        if conflict {
            return Err(RepoError::Duplicate(format!(
                "settlement batch {} {} {}",
                batch.marketplace,
                batch.cycle,
                batch.period().label()
            )));
        }
        batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn update_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()> {
        let mut batches = self.settlements.write();
        match batches.get_mut(&batch.id) {
            Some(existing) if existing.tenant_id == batch.tenant_id => {
                *existing = batch.clone();
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("settlement batch {}", batch.id))),
        }
    }

    async fn find_settlement_batch(
        &self,
        tenant_id: &str,
        batch_id: Uuid,
    ) -> RepoResult<Option<SettlementBatch>> {
        Ok(self
            .settlements
            .read()
            .get(&batch_id)
            .filter(|b| b.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_settlement_batch_by_period(
        &self,
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> RepoResult<Option<SettlementBatch>> {
        Ok(self
            .settlements
            .read()
            .values()
            .find(|b| {
                b.tenant_id == tenant_id
                    && b.marketplace == marketplace
                    && b.cycle == cycle
                    && b.period() == period
            })
            .cloned())
    }

    async fn list_due_settlement_batches(
        &self,
        tenant_id: &str,
        now: i64,
        limit: i64,
    ) -> RepoResult<Vec<SettlementBatch>> {
        let mut due: Vec<SettlementBatch> = self
            .settlements
            .read()
            .values()
            .filter(|b| b.tenant_id == tenant_id && b.is_retry_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.next_retry_at);
        Ok(limited(due, limit))
    }
}

#[async_trait]
impl CredentialRepository for InMemoryRepository {
    async fn upsert_credential(&self, credential: &StoredCredential) -> RepoResult<()> {
        let mut credentials = self.credentials.write();
        match credentials.get_mut(&credential.key) {
            Some(existing) => {
                existing.encrypted_value = credential.encrypted_value.clone();
                existing.updated_at = credential.updated_at;
            }
            None => {
                credentials.insert(credential.key.clone(), credential.clone());
            }
        }
        Ok(())
    }

    async fn find_credential(&self, key: &CredentialKey) -> RepoResult<Option<StoredCredential>> {
        Ok(self.credentials.read().get(key).cloned())
    }

    async fn delete_credential(&self, key: &CredentialKey) -> RepoResult<bool> {
        Ok(self.credentials.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{PostingSource, PostingType, SyncTrigger, TimeRange};

    #[tokio::test]
    async fn test_second_in_flight_job_is_rejected() {
        let repo = InMemoryRepository::new();
        let store_id = Uuid::new_v4();
        let range = TimeRange::new(0, 10).unwrap();
        let first = SyncJob::new("t1", store_id, range, SyncTrigger::Manual);
        repo.insert_sync_job(&first).await.unwrap();

        let second = SyncJob::new("t1", store_id, range, SyncTrigger::Scheduled);
        let err = repo.insert_sync_job(&second).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate(_)));

        // other tenant, same store id: isolated
        let other = SyncJob::new("t2", store_id, range, SyncTrigger::Manual);
        repo.insert_sync_job(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = InMemoryRepository::new();
        let mut posting = Posting::new("t1", PostingSource::Order, Uuid::new_v4(), PostingType::Sales);
        posting.transition(PostingStatus::ReadyToPost, 1).unwrap();
        repo.insert_posting(&posting).await.unwrap();

        let first = repo.try_claim_posting("t1", posting.id, 2).await.unwrap();
        assert_eq!(first.unwrap().status, PostingStatus::PostingRequested);
        assert!(repo.try_claim_posting("t1", posting.id, 3).await.unwrap().is_none());
        assert!(repo.try_claim_posting("t2", posting.id, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_tenant_scoping_on_reads() {
        let repo = InMemoryRepository::new();
        let store = Store::new("t1", "Main", "COUPANG");
        repo.insert_store(&store).await.unwrap();
        assert!(repo.find_store("t1", store.id).await.unwrap().is_some());
        assert!(repo.find_store("t2", store.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_active_mapping_deactivates_previous() {
        use shared::models::{ErpItemRef, MappingScope};

        let repo = InMemoryRepository::new();
        let scope = MappingScope {
            tenant_id: "t1".into(),
            store_id: None,
            marketplace: "COUPANG".into(),
            product_id: "P-1".into(),
            sku: "S-1".into(),
        };
        let item = |code: &str| ErpItemRef {
            item_code: code.into(),
            item_name: None,
            warehouse_code: None,
        };
        let first = ProductMapping::suggested(&scope, item("A"), 0.7);
        repo.replace_active_mapping(&first).await.unwrap();
        let second = ProductMapping::manual(&scope, item("B"));
        repo.replace_active_mapping(&second).await.unwrap();

        let active = repo.find_active_mapping(&scope).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        let old = repo.find_mapping("t1", first.id).await.unwrap().unwrap();
        assert!(!old.active);
    }
}
