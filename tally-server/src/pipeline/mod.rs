//! Reconciliation pipelines
//!
//! - `sync`: marketplace order ingestion
//! - `mapping`: marketplace product -> ERP item resolution
//! - `posting`: VAT-split ERP documents
//! - `gateway`: posting submission with in-flight exclusion
//! - `order_posting`: order -> documents -> gateway
//! - `shipment`: tracking issuance and marketplace push
//! - `settlement`: payout reconciliation
//! - `retry`: backoff policy and due-work scheduler

pub mod gateway;
pub mod mapping;
pub mod order_posting;
pub mod posting;
pub mod retry;
pub mod settlement;
pub mod shipment;
pub mod sync;

pub use gateway::ErpPostingGateway;
pub use mapping::ProductMappingResolver;
pub use order_posting::{OrderPostingReport, OrderPostingService};
pub use posting::{PostingBuilder, calculate_supply_amount, calculate_vat_amount};
pub use retry::{DispatchSummary, RetryPolicy, RetryScheduler};
pub use settlement::SettlementReconciler;
pub use shipment::ShipmentPipeline;
pub use sync::SyncOrchestrator;
