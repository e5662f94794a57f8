//! In-memory fakes and fixtures for pipeline tests

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use shared::models::{
    CredentialKey, CredentialType, ErpItemRef, MappingScope, MarketOrder,
    MarketplaceSettlementData, OrderPage, PostingDocument, PostingLine, PostingSource, PostingType,
    RawOrder, RawOrderItem, SettlementCycle, SettlementLine, SettlementPeriod, Store, TimeRange,
    VatBreakdown, idempotency_key,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::adapters::{
    AdapterError, AdapterRegistry, AdapterResult, ErpAdapter, ErpItem, MarketplaceAdapter,
    PostingResult, ShipmentPushRequest, ShipmentPushResult,
};
use crate::config::Config;
use crate::db::Repositories;
use crate::engine::Engine;
use crate::pipeline::posting::vat_breakdown;
use crate::vault::Credentials;

pub struct FakeMarketplace {
    code: String,
    orders: Mutex<Vec<RawOrder>>,
    page_size: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_failure: Mutex<Option<AdapterError>>,
    fetch_calls: AtomicUsize,
    pushed: Mutex<Vec<ShipmentPushRequest>>,
    push_failure: Mutex<Option<AdapterError>>,
    push_calls: AtomicUsize,
    settlement: Mutex<MarketplaceSettlementData>,
    settlement_failure: Mutex<Option<AdapterError>>,
}

impl FakeMarketplace {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            orders: Mutex::new(Vec::new()),
            page_size: AtomicUsize::new(100),
            fetch_delay: Mutex::new(None),
            fetch_failure: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            pushed: Mutex::new(Vec::new()),
            push_failure: Mutex::new(None),
            push_calls: AtomicUsize::new(0),
            settlement: Mutex::new(MarketplaceSettlementData::default()),
            settlement_failure: Mutex::new(None),
        }
    }

    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    pub fn add_orders(&self, orders: Vec<RawOrder>) {
        self.orders.lock().extend(orders);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    /// Next fetch fails once with `err`
    pub fn fail_fetch(&self, err: AdapterError) {
        *self.fetch_failure.lock() = Some(err);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fail_push(&self, err: AdapterError) {
        *self.push_failure.lock() = Some(err);
    }

    pub fn pushed(&self) -> Vec<ShipmentPushRequest> {
        self.pushed.lock().clone()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn set_settlement(&self, data: MarketplaceSettlementData) {
        *self.settlement.lock() = data;
    }

    pub fn settlement(&self) -> MarketplaceSettlementData {
        self.settlement.lock().clone()
    }

    pub fn fail_settlement(&self, err: AdapterError) {
        *self.settlement_failure.lock() = Some(err);
    }
}

#[async_trait]
impl MarketplaceAdapter for FakeMarketplace {
    fn code(&self) -> &str {
        &self.code
    }

    fn credential_keys(&self) -> &[&'static str] {
        &["access_key", "secret_key"]
    }

    async fn fetch_orders(
        &self,
        credentials: &Credentials,
        range: TimeRange,
        cursor: Option<&str>,
    ) -> AdapterResult<OrderPage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fetch_failure.lock().take() {
            return Err(err);
        }
        if credentials.get("access_key").is_none() {
            return Err(AdapterError::Authentication("access_key missing".into()));
        }

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| AdapterError::MalformedPayload(format!("bad cursor {c}")))?,
            None => 0,
        };
        let page_size = self.page_size.load(Ordering::SeqCst);
        let matching: Vec<RawOrder> = self
            .orders
            .lock()
            .iter()
            .filter(|o| range.contains(o.ordered_at))
            .cloned()
            .collect();
        let orders: Vec<RawOrder> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + orders.len();
        Ok(OrderPage {
            orders,
            next_cursor: (next < matching.len()).then(|| next.to_string()),
        })
    }

    async fn push_shipment(
        &self,
        _credentials: &Credentials,
        request: &ShipmentPushRequest,
    ) -> AdapterResult<ShipmentPushResult> {
        let n = self.push_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.push_failure.lock().take() {
            return Err(err);
        }
        self.pushed.lock().push(request.clone());
        Ok(ShipmentPushResult {
            reference: Some(format!("ACK-{n}")),
        })
    }

    async fn fetch_settlement(
        &self,
        _credentials: &Credentials,
        _cycle: SettlementCycle,
        _period: SettlementPeriod,
    ) -> AdapterResult<MarketplaceSettlementData> {
        if let Some(err) = self.settlement_failure.lock().take() {
            return Err(err);
        }
        Ok(self.settlement())
    }

    async fn test_connection(&self, credentials: &Credentials) -> AdapterResult<bool> {
        Ok(credentials.get("access_key").is_some())
    }
}

#[derive(Default)]
pub struct FakeErp {
    posted: Mutex<Vec<PostingDocument>>,
    post_failure: Mutex<Option<AdapterError>>,
    post_delay: Mutex<Option<Duration>>,
    post_calls: AtomicUsize,
    items: Mutex<Vec<ErpItem>>,
}

impl FakeErp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_post(&self, err: AdapterError) {
        *self.post_failure.lock() = Some(err);
    }

    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock() = Some(delay);
    }

    pub fn set_items(&self, items: Vec<ErpItem>) {
        *self.items.lock() = items;
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    pub fn posted_documents(&self) -> Vec<PostingDocument> {
        self.posted.lock().clone()
    }
}

#[async_trait]
impl ErpAdapter for FakeErp {
    fn code(&self) -> &str {
        "ECOUNT"
    }

    fn credential_keys(&self) -> &[&'static str] {
        &["api_key"]
    }

    async fn post_sales_document(
        &self,
        _credentials: &Credentials,
        _tenant_id: &str,
        document: &PostingDocument,
    ) -> AdapterResult<PostingResult> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.post_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.post_failure.lock().take() {
            return Err(err);
        }
        let mut posted = self.posted.lock();
        posted.push(document.clone());
        Ok(PostingResult {
            erp_reference: format!("ERP-{}", posted.len()),
        })
    }

    async fn get_items(&self, _credentials: &Credentials) -> AdapterResult<Vec<ErpItem>> {
        Ok(self.items.lock().clone())
    }

    async fn test_connection(&self, _credentials: &Credentials) -> AdapterResult<bool> {
        Ok(true)
    }
}

/// Engine over in-memory storage with one COUPANG store and fake vendors
pub struct TestEngine {
    pub engine: Engine,
    pub tenant_id: String,
    pub store: Store,
    pub marketplace: Arc<FakeMarketplace>,
    pub erp: Arc<FakeErp>,
}

impl TestEngine {
    pub async fn new() -> Self {
        let tenant_id = "tenant-1".to_string();
        let marketplace = Arc::new(FakeMarketplace::new("COUPANG"));
        let erp = Arc::new(FakeErp::new());

        let mut adapters = AdapterRegistry::new();
        adapters.register_marketplace(marketplace.clone());
        adapters.set_erp(erp.clone());

        let config = Config::from_source(|_| None).unwrap();
        let engine = Engine::new(config, Repositories::in_memory(), adapters);

        let store = Store::new(&tenant_id, "Main store", "COUPANG");
        engine.repos.stores.insert_store(&store).await.unwrap();

        let secrets = [
            (CredentialType::Marketplace, "access_key", "ak-test"),
            (CredentialType::Marketplace, "secret_key", "sk-test"),
            (CredentialType::Erp, "api_key", "erp-test"),
        ];
        for (credential_type, name, value) in secrets {
            let key = CredentialKey::new(&tenant_id, None, credential_type, name);
            engine.vault.put(&key, value).await.unwrap();
        }

        Self {
            engine,
            tenant_id,
            store,
            marketplace,
            erp,
        }
    }

    pub fn scope(&self, store_id: Option<Uuid>, product_id: &str, sku: &str) -> MappingScope {
        MappingScope {
            tenant_id: self.tenant_id.clone(),
            store_id,
            marketplace: self.store.marketplace.clone(),
            product_id: product_id.to_string(),
            sku: sku.to_string(),
        }
    }

    /// Store-scoped manual mapping
    pub async fn map(&self, product_id: &str, sku: &str, item_code: &str) {
        let scope = self.scope(Some(self.store.id), product_id, sku);
        self.engine
            .resolver
            .set_manual_mapping(
                &scope,
                ErpItemRef {
                    item_code: item_code.to_string(),
                    item_name: Some(format!("{item_code} item")),
                    warehouse_code: None,
                },
            )
            .await
            .unwrap();
    }

    pub async fn insert_order(&self, mut raw: RawOrder, shipping_fee: Decimal) -> MarketOrder {
        raw.shipping_fee = shipping_fee;
        let order = MarketOrder::from_raw(&self.tenant_id, self.store.id, &self.store.marketplace, raw);
        self.engine.repos.orders.upsert_order(&order).await.unwrap();
        order
    }
}

/// Order with one quantity-1 line per `(product, sku, total)`
pub fn raw_order(id: &str, ordered_at: i64, lines: &[(&str, &str, Decimal)]) -> RawOrder {
    RawOrder {
        marketplace_order_id: id.to_string(),
        ordered_at,
        buyer_name: Some("Buyer".into()),
        shipping_fee: Decimal::ZERO,
        items: lines
            .iter()
            .map(|(product, sku, total)| RawOrderItem {
                product_id: product.to_string(),
                sku: sku.to_string(),
                name: format!("{product} name"),
                quantity: 1,
                unit_price: *total,
                total_with_vat: *total,
                cancelled: false,
            })
            .collect(),
    }
}

/// Deterministic SALES document with a single 11000 line
pub fn sample_document(tenant_id: &str) -> PostingDocument {
    let reference_id = Uuid::from_u128(42);
    let amounts = vat_breakdown(Decimal::new(11000, 0), Decimal::new(1, 1));
    let mut totals = VatBreakdown::default();
    totals.add(&amounts);
    PostingDocument {
        idempotency_key: idempotency_key(tenant_id, &reference_id, PostingType::Sales),
        tenant_id: tenant_id.to_string(),
        posting_type: PostingType::Sales,
        source: PostingSource::Order,
        reference_id,
        external_reference: "MO-42".into(),
        counterparty: "COUPANG".into(),
        document_date: 1_700_000_000_000,
        lines: vec![PostingLine {
            line_no: 1,
            item_code: "ERP-001".into(),
            description: "P1 name".into(),
            quantity: 1,
            warehouse_code: None,
            reference: "P1:S1".into(),
            amounts,
        }],
        totals,
    }
}

pub fn settlement_line(
    order_id: &str,
    sales: Decimal,
    commission: Decimal,
    pg_fee: Decimal,
) -> SettlementLine {
    SettlementLine {
        marketplace_order_id: order_id.to_string(),
        sales_amount: sales,
        commission,
        pg_fee,
        shipping_settled: Decimal::ZERO,
        payout: sales - commission - pg_fee,
    }
}
