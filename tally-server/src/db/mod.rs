//! Persistence layer
//!
//! Repository traits consumed by the pipelines, with a PostgreSQL
//! implementation and an in-memory one for tests and local runs.
//! Every method is scoped by `tenant_id` except [`StoreRepository::list_active_stores`],
//! which schedulers use to discover tenants.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use shared::error::{AppError, ErrorCode};
use shared::models::{
    CredentialKey, MappingScope, MappingStatus, MarketOrder, OrderPostingStatus, Posting,
    PostingStatus, ProductMapping, SettlementBatch, SettlementCycle, SettlementPeriod, Shipment,
    ShipmentStatus, Store, StoredCredential, SyncJob,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

/// Repository error types
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepoError::Duplicate(db.message().to_string())
            }
            sqlx::Error::RowNotFound => RepoError::NotFound(err.to_string()),
            _ => RepoError::Database(err.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(msg) => AppError::with_message(ErrorCode::NotFound, msg),
            RepoError::Duplicate(msg) => AppError::with_message(ErrorCode::AlreadyExists, msg),
            RepoError::Database(msg) => AppError::database(msg),
            RepoError::Validation(msg) => AppError::validation(msg),
        }
    }
}

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepoError>;

/// Whether an upsert inserted a new row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[async_trait]
pub trait StoreRepository: Send + Sync {
    async fn insert_store(&self, store: &Store) -> RepoResult<()>;
    async fn find_store(&self, tenant_id: &str, store_id: Uuid) -> RepoResult<Option<Store>>;
    /// Cross-tenant: every active store
    async fn list_active_stores(&self) -> RepoResult<Vec<Store>>;
    async fn set_store_active(&self, tenant_id: &str, store_id: Uuid, active: bool)
    -> RepoResult<()>;
    async fn mark_store_synced(&self, tenant_id: &str, store_id: Uuid, until: i64)
    -> RepoResult<()>;
}

#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    /// Fails with `Duplicate` when the store already has a PENDING/RUNNING job
    async fn insert_sync_job(&self, job: &SyncJob) -> RepoResult<()>;
    async fn update_sync_job(&self, job: &SyncJob) -> RepoResult<()>;
    async fn find_sync_job(&self, tenant_id: &str, job_id: Uuid) -> RepoResult<Option<SyncJob>>;
    async fn find_in_flight_job(&self, tenant_id: &str, store_id: Uuid)
    -> RepoResult<Option<SyncJob>>;
    /// Active FAILED jobs whose retry time has passed
    async fn list_due_sync_jobs(&self, tenant_id: &str, now: i64, limit: i64)
    -> RepoResult<Vec<SyncJob>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert or refresh by (tenant, store, marketplace order id). Only the
    /// marketplace-sourced columns are overwritten on update.
    async fn upsert_order(&self, order: &MarketOrder) -> RepoResult<UpsertOutcome>;
    async fn find_order(&self, tenant_id: &str, order_id: Uuid) -> RepoResult<Option<MarketOrder>>;
    async fn find_order_by_marketplace_id(
        &self,
        tenant_id: &str,
        marketplace: &str,
        marketplace_order_id: &str,
    ) -> RepoResult<Option<MarketOrder>>;
    async fn update_order_posting(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        status: OrderPostingStatus,
        error: Option<&str>,
    ) -> RepoResult<()>;
    async fn update_order_settlement(
        &self,
        tenant_id: &str,
        order_id: Uuid,
        settlement: OrderSettlement,
    ) -> RepoResult<()>;
    /// Orders still NOT_POSTED or PENDING_MAPPING, oldest first
    async fn list_orders_for_posting(&self, tenant_id: &str, limit: i64)
    -> RepoResult<Vec<MarketOrder>>;
}

/// Settlement figures copied onto a matched order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSettlement {
    pub commission: Decimal,
    pub pg_fee: Decimal,
    pub shipping_settled: Decimal,
    pub batch_id: Uuid,
}

#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// Exact scope match; `scope.store_id = None` addresses the fallback slot
    async fn find_active_mapping(&self, scope: &MappingScope)
    -> RepoResult<Option<ProductMapping>>;
    async fn find_mapping(&self, tenant_id: &str, mapping_id: Uuid)
    -> RepoResult<Option<ProductMapping>>;
    /// Deactivate any other active mapping in the same scope, then store this one
    async fn replace_active_mapping(&self, mapping: &ProductMapping) -> RepoResult<()>;
    async fn update_mapping(&self, mapping: &ProductMapping) -> RepoResult<()>;
    async fn list_mappings(
        &self,
        tenant_id: &str,
        status: Option<MappingStatus>,
    ) -> RepoResult<Vec<ProductMapping>>;
}

#[async_trait]
pub trait PostingRepository: Send + Sync {
    /// Fails with `Duplicate` on an idempotency key conflict
    async fn insert_posting(&self, posting: &Posting) -> RepoResult<()>;
    async fn update_posting(&self, posting: &Posting) -> RepoResult<()>;
    /// Write `posting` only while the stored row is still in `expected`.
    /// `false` means another writer moved it first.
    async fn update_posting_if_status(&self, posting: &Posting, expected: PostingStatus)
    -> RepoResult<bool>;
    async fn find_posting(&self, tenant_id: &str, posting_id: Uuid) -> RepoResult<Option<Posting>>;
    async fn find_posting_by_key(&self, tenant_id: &str, idempotency_key: &str)
    -> RepoResult<Option<Posting>>;
    /// Atomic READY_TO_POST -> POSTING_REQUESTED. `None` when the posting is
    /// not in READY_TO_POST (already claimed, posted, or failed).
    async fn try_claim_posting(&self, tenant_id: &str, posting_id: Uuid, now: i64)
    -> RepoResult<Option<Posting>>;
    async fn list_postings_for_reference(&self, tenant_id: &str, reference_id: Uuid)
    -> RepoResult<Vec<Posting>>;
    /// Active FAILED postings whose retry time has passed
    async fn list_due_postings(&self, tenant_id: &str, now: i64, limit: i64)
    -> RepoResult<Vec<Posting>>;
    /// POSTING_REQUESTED claims taken before `claimed_before`
    async fn list_stale_claims(&self, tenant_id: &str, claimed_before: i64)
    -> RepoResult<Vec<Posting>>;
}

#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    /// Fails with `Duplicate` when the order already has a shipment
    async fn insert_shipment(&self, shipment: &Shipment) -> RepoResult<()>;
    async fn update_shipment(&self, shipment: &Shipment) -> RepoResult<()>;
    async fn find_shipment(&self, tenant_id: &str, shipment_id: Uuid)
    -> RepoResult<Option<Shipment>>;
    async fn find_shipment_by_order(&self, tenant_id: &str, order_id: Uuid)
    -> RepoResult<Option<Shipment>>;
    async fn list_shipments_by_status(
        &self,
        tenant_id: &str,
        status: ShipmentStatus,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>>;
    /// Active FAILED shipments under the retry budget whose retry time has passed
    async fn list_due_shipments(
        &self,
        tenant_id: &str,
        now: i64,
        max_retries: i32,
        limit: i64,
    ) -> RepoResult<Vec<Shipment>>;
    /// Active FAILED shipments at or over the retry budget, or with no retry
    /// scheduled
    async fn list_shipments_for_review(&self, tenant_id: &str, max_retries: i32)
    -> RepoResult<Vec<Shipment>>;
}

#[async_trait]
pub trait SettlementRepository: Send + Sync {
    /// Fails with `Duplicate` on (tenant, marketplace, cycle, period) conflict
    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()>;
    async fn update_settlement_batch(&self, batch: &SettlementBatch) -> RepoResult<()>;
    async fn find_settlement_batch(&self, tenant_id: &str, batch_id: Uuid)
    -> RepoResult<Option<SettlementBatch>>;
    async fn find_settlement_batch_by_period(
        &self,
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> RepoResult<Option<SettlementBatch>>;
    async fn list_due_settlement_batches(&self, tenant_id: &str, now: i64, limit: i64)
    -> RepoResult<Vec<SettlementBatch>>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn upsert_credential(&self, credential: &StoredCredential) -> RepoResult<()>;
    async fn find_credential(&self, key: &CredentialKey) -> RepoResult<Option<StoredCredential>>;
    async fn delete_credential(&self, key: &CredentialKey) -> RepoResult<bool>;
}

/// Repository handles injected into the pipelines
#[derive(Clone)]
pub struct Repositories {
    pub stores: Arc<dyn StoreRepository>,
    pub sync_jobs: Arc<dyn SyncJobRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub mappings: Arc<dyn MappingRepository>,
    pub postings: Arc<dyn PostingRepository>,
    pub shipments: Arc<dyn ShipmentRepository>,
    pub settlements: Arc<dyn SettlementRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
}

impl Repositories {
    fn from_backend<R>(backend: Arc<R>) -> Self
    where
        R: StoreRepository
            + SyncJobRepository
            + OrderRepository
            + MappingRepository
            + PostingRepository
            + ShipmentRepository
            + SettlementRepository
            + CredentialRepository
            + 'static,
    {
        Self {
            stores: backend.clone(),
            sync_jobs: backend.clone(),
            orders: backend.clone(),
            mappings: backend.clone(),
            postings: backend.clone(),
            shipments: backend.clone(),
            settlements: backend.clone(),
            credentials: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryRepository::new()))
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::from_backend(Arc::new(PgRepository::new(pool)))
    }

    /// Distinct tenants owning at least one active store
    pub async fn active_tenants(&self) -> RepoResult<Vec<String>> {
        let mut tenants: Vec<String> = self
            .stores
            .list_active_stores()
            .await?
            .into_iter()
            .map(|s| s.tenant_id)
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}
