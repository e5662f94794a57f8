//! Pipeline wiring
//!
//! Every component gets its repositories and adapters through its constructor;
//! this is the one place they are assembled.

use std::sync::Arc;

use crate::adapters::AdapterRegistry;
use crate::config::Config;
use crate::crypto::MasterKey;
use crate::db::{PgRepository, Repositories};
use crate::pipeline::{
    ErpPostingGateway, OrderPostingService, PostingBuilder, ProductMappingResolver, RetryScheduler,
    SettlementReconciler, ShipmentPipeline, SyncOrchestrator,
};
use crate::vault::CredentialVault;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared engine state
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub repos: Repositories,
    pub adapters: Arc<AdapterRegistry>,
    pub vault: Arc<CredentialVault>,
    pub resolver: Arc<ProductMappingResolver>,
    pub gateway: Arc<ErpPostingGateway>,
    pub order_posting: Arc<OrderPostingService>,
    pub sync: Arc<SyncOrchestrator>,
    pub shipments: Arc<ShipmentPipeline>,
    pub settlements: Arc<SettlementReconciler>,
    pub retry: Arc<RetryScheduler>,
}

impl Engine {
    pub fn new(config: Config, repos: Repositories, adapters: AdapterRegistry) -> Self {
        let config = Arc::new(config);
        let adapters = Arc::new(adapters);
        let vault = Arc::new(CredentialVault::new(
            repos.credentials.clone(),
            MasterKey::from_material(config.vault_key.as_bytes()),
        ));
        let builder = PostingBuilder::new(config.vat_rate, config.posting_items.clone());

        let resolver = Arc::new(ProductMappingResolver::new(
            repos.clone(),
            config.suggestion_min_confidence,
        ));
        let gateway = Arc::new(ErpPostingGateway::new(
            repos.clone(),
            adapters.clone(),
            vault.clone(),
            &config,
        ));
        let order_posting = Arc::new(OrderPostingService::new(
            repos.clone(),
            adapters.clone(),
            vault.clone(),
            resolver.clone(),
            builder.clone(),
            gateway.clone(),
            config.worker_concurrency,
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            repos.clone(),
            adapters.clone(),
            vault.clone(),
            &config,
        ));
        let shipments = Arc::new(ShipmentPipeline::new(
            repos.clone(),
            adapters.clone(),
            vault.clone(),
            &config,
        ));
        let settlements = Arc::new(SettlementReconciler::new(
            repos.clone(),
            adapters.clone(),
            vault.clone(),
            builder,
            gateway.clone(),
            &config,
        ));
        let retry = Arc::new(RetryScheduler::new(
            repos.clone(),
            sync.clone(),
            gateway.clone(),
            shipments.clone(),
            settlements.clone(),
            config.worker_concurrency,
        ));

        Self {
            config,
            repos,
            adapters,
            vault,
            resolver,
            gateway,
            order_posting,
            sync,
            shipments,
            settlements,
            retry,
        }
    }

    /// Connect storage per configuration, then wire the pipelines
    ///
    /// Without `DATABASE_URL` (development only) everything lives in memory.
    pub async fn connect(config: Config, adapters: AdapterRegistry) -> Result<Self, BoxError> {
        let repos = match &config.database_url {
            Some(url) => {
                let pg = PgRepository::connect(url).await?;
                pg.migrate().await?;
                tracing::info!("PostgreSQL ready, migrations applied");
                Repositories::postgres(pg.pool().clone())
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storage");
                Repositories::in_memory()
            }
        };
        Ok(Self::new(config, repos, adapters))
    }
}
