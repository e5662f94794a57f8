//! Marketplace orders as ingested by the sync pipeline

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::ParseEnumError;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::util::now_millis;

/// Half-open time window `[start, end)` in epoch millis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> AppResult<Self> {
        if start >= end {
            return Err(AppError::with_message(
                ErrorCode::InvalidTimeRange,
                format!("invalid time range [{start}, {end})"),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Order line as returned by a marketplace adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrderItem {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    /// Line total, VAT included
    pub total_with_vat: Decimal,
    #[serde(default)]
    pub cancelled: bool,
}

/// Order as returned by a marketplace adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub marketplace_order_id: String,
    pub ordered_at: i64,
    pub buyer_name: Option<String>,
    /// Shipping fee charged to the buyer, VAT included
    #[serde(default)]
    pub shipping_fee: Decimal,
    pub items: Vec<RawOrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_with_vat: Decimal,
    #[serde(default)]
    pub cancelled: bool,
}

impl OrderItem {
    /// `productId:sku`, the key reported in mapping-required errors
    pub fn mapping_key(&self) -> String {
        mapping_key(&self.product_id, &self.sku)
    }
}

pub fn mapping_key(product_id: &str, sku: &str) -> String {
    format!("{product_id}:{sku}")
}

impl From<RawOrderItem> for OrderItem {
    fn from(raw: RawOrderItem) -> Self {
        Self {
            product_id: raw.product_id,
            sku: raw.sku,
            name: raw.name,
            quantity: raw.quantity,
            unit_price: raw.unit_price,
            total_with_vat: raw.total_with_vat,
            cancelled: raw.cancelled,
        }
    }
}

/// ERP posting progress of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPostingStatus {
    NotPosted,
    PendingMapping,
    Posted,
    Failed,
}

impl OrderPostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPosted => "NOT_POSTED",
            Self::PendingMapping => "PENDING_MAPPING",
            Self::Posted => "POSTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderPostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderPostingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_POSTED" => Ok(Self::NotPosted),
            "PENDING_MAPPING" => Ok(Self::PendingMapping),
            "POSTED" => Ok(Self::Posted),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("order posting status", s)),
        }
    }
}

/// An ingested order, unique per (tenant, store, marketplace order id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub id: Uuid,
    pub tenant_id: String,
    pub store_id: Uuid,
    pub marketplace: String,
    pub marketplace_order_id: String,
    pub ordered_at: i64,
    pub buyer_name: Option<String>,
    pub shipping_fee: Decimal,
    /// Sum of non-cancelled line totals plus shipping fee
    pub total_amount: Decimal,
    pub items: Vec<OrderItem>,
    pub posting_status: OrderPostingStatus,
    pub posting_error: Option<String>,
    // Settlement fields, filled by settlement collection
    pub commission: Option<Decimal>,
    pub pg_fee: Option<Decimal>,
    pub shipping_settled: Option<Decimal>,
    pub settlement_batch_id: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MarketOrder {
    pub fn from_raw(tenant_id: &str, store_id: Uuid, marketplace: &str, raw: RawOrder) -> Self {
        let now = now_millis();
        let items: Vec<OrderItem> = raw.items.into_iter().map(OrderItem::from).collect();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            store_id,
            marketplace: marketplace.to_string(),
            marketplace_order_id: raw.marketplace_order_id,
            ordered_at: raw.ordered_at,
            buyer_name: raw.buyer_name,
            total_amount: order_total(&items, raw.shipping_fee),
            shipping_fee: raw.shipping_fee,
            items,
            posting_status: OrderPostingStatus::NotPosted,
            posting_error: None,
            commission: None,
            pg_fee: None,
            shipping_settled: None,
            settlement_batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn active_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(|i| !i.cancelled)
    }

    pub fn cancelled_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(|i| i.cancelled)
    }
}

fn order_total(items: &[OrderItem], shipping_fee: Decimal) -> Decimal {
    items
        .iter()
        .filter(|i| !i.cancelled)
        .map(|i| i.total_with_vat)
        .sum::<Decimal>()
        + shipping_fee
}

/// One page of a marketplace order fetch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPage {
    pub orders: Vec<RawOrder>,
    /// Opaque cursor for the next page; `None` when exhausted
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw_item(product: &str, sku: &str, total: Decimal, cancelled: bool) -> RawOrderItem {
        RawOrderItem {
            product_id: product.to_string(),
            sku: sku.to_string(),
            name: format!("{product} item"),
            quantity: 1,
            unit_price: total,
            total_with_vat: total,
            cancelled,
        }
    }

    #[test]
    fn test_time_range_rejects_inverted() {
        assert!(TimeRange::new(10, 20).is_ok());
        let err = TimeRange::new(20, 20).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeRange);
        assert!(TimeRange::new(30, 20).is_err());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
    }

    #[test]
    fn test_from_raw_excludes_cancelled_lines_from_total() {
        let raw = RawOrder {
            marketplace_order_id: "MO-1".to_string(),
            ordered_at: 1_000,
            buyer_name: None,
            shipping_fee: dec!(3000),
            items: vec![
                raw_item("P-1", "S-1", dec!(11000), false),
                raw_item("P-2", "S-2", dec!(5500), true),
            ],
        };
        let order = MarketOrder::from_raw("t1", Uuid::new_v4(), "COUPANG", raw);
        assert_eq!(order.total_amount, dec!(14000));
        assert_eq!(order.active_items().count(), 1);
        assert_eq!(order.cancelled_items().count(), 1);
        assert_eq!(order.posting_status, OrderPostingStatus::NotPosted);
        assert_eq!(order.items[0].mapping_key(), "P-1:S-1");
    }
}
