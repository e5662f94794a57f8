//! Domain records shared by the pipelines and repositories

pub mod credential;
pub mod order;
pub mod posting;
pub mod product_mapping;
pub mod settlement;
pub mod shipment;
pub mod state;
pub mod store;
pub mod sync_job;

pub use credential::{CredentialKey, CredentialType, StoredCredential};
pub use order::{
    MarketOrder, OrderItem, OrderPage, OrderPostingStatus, RawOrder, RawOrderItem, TimeRange,
    mapping_key,
};
pub use posting::{
    Posting, PostingDocument, PostingLine, PostingSource, PostingStatus, PostingType,
    VatBreakdown, idempotency_key,
};
pub use product_mapping::{ErpItemRef, MappingScope, MappingStatus, MappingType, ProductMapping};
pub use settlement::{
    MarketplaceSettlementData, SettlementBatch, SettlementCycle, SettlementLine,
    SettlementPeriod, SettlementStatus,
};
pub use shipment::{MarketPushStatus, Shipment, ShipmentStatus};
pub use state::{InvalidTransition, ParseEnumError, StateMachine, advance};
pub use store::Store;
pub use sync_job::{SyncJob, SyncJobStatus, SyncTrigger};
