//! Marketplace and ERP adapter contracts
//!
//! Vendor clients implement [`MarketplaceAdapter`] or [`ErpAdapter`] and are
//! registered once at startup. Pipelines only see these traits, and they see
//! vendor failures only as [`AdapterError`], already classified by
//! [`AdapterError::kind`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::error::{AppError, ErrorCode, ErrorKind};
use shared::models::{
    MarketplaceSettlementData, OrderPage, PostingDocument, SettlementCycle, SettlementPeriod,
    TimeRange,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::vault::Credentials;

/// Vendor call failure
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("{0} is not supported by this adapter")]
    Unsupported(&'static str),
}

impl AdapterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Timeout => ErrorCode::TimeoutError,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            // 4xx other than auth are the caller's fault and will not heal on retry
            Self::Upstream { status, .. } if *status < 500 => ErrorCode::MalformedPayload,
            Self::Upstream { .. } => ErrorCode::UpstreamUnavailable,
            Self::Authentication(_) => ErrorCode::AuthenticationFailed,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::MalformedPayload(_) | Self::Unsupported(_) => ErrorCode::MalformedPayload,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<AdapterError> for AppError {
    fn from(err: AdapterError) -> Self {
        let mut app = AppError::with_message(err.code(), err.to_string());
        if let AdapterError::RateLimited {
            retry_after: Some(after),
        } = &err
        {
            app = app.with_detail("retry_after_ms", after.as_millis() as u64);
        }
        if let AdapterError::Upstream { status, .. } = &err {
            app = app.with_detail("status", *status);
        }
        app
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Tracking number delivered back to a marketplace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentPushRequest {
    pub marketplace_order_id: String,
    pub carrier_code: String,
    pub tracking_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentPushResult {
    /// Marketplace-side acknowledgement id, when the vendor returns one
    pub reference: Option<String>,
}

/// ERP acknowledgement of a posted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingResult {
    pub erp_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpItem {
    pub item_code: String,
    pub item_name: String,
    pub warehouse_code: Option<String>,
    /// Vendor-side SKU or barcode, if the ERP tracks one
    pub sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpCustomer {
    pub customer_code: String,
    pub name: String,
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    /// Marketplace code, matches `Store::marketplace`
    fn code(&self) -> &str;

    /// Credential key names loaded from the vault before each call
    fn credential_keys(&self) -> &[&'static str];

    /// One page of orders in `range`; pass the previous page's cursor to continue
    async fn fetch_orders(
        &self,
        credentials: &Credentials,
        range: TimeRange,
        cursor: Option<&str>,
    ) -> AdapterResult<OrderPage>;

    async fn push_shipment(
        &self,
        credentials: &Credentials,
        request: &ShipmentPushRequest,
    ) -> AdapterResult<ShipmentPushResult>;

    async fn fetch_settlement(
        &self,
        credentials: &Credentials,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> AdapterResult<MarketplaceSettlementData>;

    async fn test_connection(&self, credentials: &Credentials) -> AdapterResult<bool>;
}

#[async_trait]
pub trait ErpAdapter: Send + Sync {
    fn code(&self) -> &str;

    fn credential_keys(&self) -> &[&'static str];

    /// Must treat `document.idempotency_key` as a dedup key on the ERP side
    async fn post_sales_document(
        &self,
        credentials: &Credentials,
        tenant_id: &str,
        document: &PostingDocument,
    ) -> AdapterResult<PostingResult>;

    async fn get_items(&self, credentials: &Credentials) -> AdapterResult<Vec<ErpItem>>;

    async fn get_customers(&self, _credentials: &Credentials) -> AdapterResult<Vec<ErpCustomer>> {
        Err(AdapterError::Unsupported("get_customers"))
    }

    async fn test_connection(&self, credentials: &Credentials) -> AdapterResult<bool>;
}

/// Adapters available to the pipelines
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    marketplaces: HashMap<String, Arc<dyn MarketplaceAdapter>>,
    erp: Option<Arc<dyn ErpAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_marketplace(&mut self, adapter: Arc<dyn MarketplaceAdapter>) {
        let code = adapter.code().to_ascii_uppercase();
        tracing::info!(marketplace = %code, "Marketplace adapter registered");
        self.marketplaces.insert(code, adapter);
    }

    pub fn set_erp(&mut self, adapter: Arc<dyn ErpAdapter>) {
        tracing::info!(erp = %adapter.code(), "ERP adapter registered");
        self.erp = Some(adapter);
    }

    pub fn marketplace(&self, code: &str) -> Result<Arc<dyn MarketplaceAdapter>, AppError> {
        self.marketplaces
            .get(&code.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| {
                AppError::with_message(
                    ErrorCode::AdapterNotRegistered,
                    format!("no adapter for marketplace '{code}'"),
                )
                .with_detail("marketplace", code)
            })
    }

    pub fn erp(&self) -> Result<Arc<dyn ErpAdapter>, AppError> {
        self.erp.clone().ok_or_else(|| {
            AppError::with_message(ErrorCode::AdapterNotRegistered, "no ERP adapter registered")
        })
    }

    pub fn marketplace_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.marketplaces.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn erp_code(&self) -> Option<String> {
        self.erp.as_ref().map(|e| e.code().to_string())
    }
}
