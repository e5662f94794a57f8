//! Per-order shipment with its marketplace push state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::MarketOrder;
use super::state::{InvalidTransition, ParseEnumError, StateMachine, advance};
use crate::util::now_millis;

/// Shipment lifecycle
///
/// READY -> INVOICE_REQUESTED -> INVOICE_ISSUED -> MARKET_PUSH_REQUESTED
/// -> MARKET_PUSHED -> SHIPPED -> DELIVERED. FAILED is entered from either
/// request state and returns to one of them. Re-issuing a tracking number
/// goes back to INVOICE_REQUESTED from INVOICE_ISSUED or MARKET_PUSHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    Ready,
    InvoiceRequested,
    InvoiceIssued,
    MarketPushRequested,
    MarketPushed,
    Shipped,
    Delivered,
    Failed,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::InvoiceRequested => "INVOICE_REQUESTED",
            Self::InvoiceIssued => "INVOICE_ISSUED",
            Self::MarketPushRequested => "MARKET_PUSH_REQUESTED",
            Self::MarketPushed => "MARKET_PUSHED",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }
}

impl StateMachine for ShipmentStatus {
    const ENTITY: &'static str = "shipment";
    const ALL: &'static [Self] = &[
        Self::Ready,
        Self::InvoiceRequested,
        Self::InvoiceIssued,
        Self::MarketPushRequested,
        Self::MarketPushed,
        Self::Shipped,
        Self::Delivered,
        Self::Failed,
    ];

    fn can_transition_to(&self, target: Self) -> bool {
        use ShipmentStatus::*;
        matches!(
            (self, target),
            (Ready, InvoiceRequested)
                | (InvoiceRequested, InvoiceIssued)
                | (InvoiceRequested, Failed)
                | (InvoiceIssued, MarketPushRequested)
                | (InvoiceIssued, InvoiceRequested)
                | (MarketPushRequested, MarketPushed)
                | (MarketPushRequested, Failed)
                | (MarketPushed, Shipped)
                | (MarketPushed, InvoiceRequested)
                | (Shipped, Delivered)
                | (Failed, InvoiceRequested)
                | (Failed, MarketPushRequested)
        )
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "INVOICE_REQUESTED" => Ok(Self::InvoiceRequested),
            "INVOICE_ISSUED" => Ok(Self::InvoiceIssued),
            "MARKET_PUSH_REQUESTED" => Ok(Self::MarketPushRequested),
            "MARKET_PUSHED" => Ok(Self::MarketPushed),
            "SHIPPED" => Ok(Self::Shipped),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("shipment status", s)),
        }
    }
}

/// Marketplace push axis
///
/// PENDING -> PUSHING -> {SUCCESS, FAILED}; FAILED -> PUSHING.
/// SUCCESS -> PENDING only through tracking re-issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPushStatus {
    Pending,
    Pushing,
    Success,
    Failed,
}

impl MarketPushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Pushing => "PUSHING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl StateMachine for MarketPushStatus {
    const ENTITY: &'static str = "market push";
    const ALL: &'static [Self] = &[Self::Pending, Self::Pushing, Self::Success, Self::Failed];

    fn can_transition_to(&self, target: Self) -> bool {
        use MarketPushStatus::*;
        matches!(
            (self, target),
            (Pending, Pushing)
                | (Pushing, Success)
                | (Pushing, Failed)
                | (Failed, Pushing)
                | (Success, Pending)
        )
    }
}

impl fmt::Display for MarketPushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketPushStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PUSHING" => Ok(Self::Pushing),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("market push status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: Uuid,
    pub tenant_id: String,
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub marketplace: String,
    pub marketplace_order_id: String,
    pub carrier_code: Option<String>,
    pub tracking_number: Option<String>,
    pub status: ShipmentStatus,
    pub market_push_status: MarketPushStatus,
    /// Failed push attempts since the tracking number was issued
    pub retry_count: i32,
    pub last_attempted_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Cleared on cancel; workers skip inactive shipments
    pub active: bool,
    pub pushed_at: Option<i64>,
    pub shipped_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Shipment {
    pub fn for_order(order: &MarketOrder) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            tenant_id: order.tenant_id.clone(),
            order_id: order.id,
            store_id: order.store_id,
            marketplace: order.marketplace.clone(),
            marketplace_order_id: order.marketplace_order_id.clone(),
            carrier_code: None,
            tracking_number: None,
            status: ShipmentStatus::Ready,
            market_push_status: MarketPushStatus::Pending,
            retry_count: 0,
            last_attempted_at: None,
            next_retry_at: None,
            last_error: None,
            active: true,
            pushed_at: None,
            shipped_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, target: ShipmentStatus, now: i64) -> Result<(), InvalidTransition> {
        advance(&mut self.status, target)?;
        match target {
            ShipmentStatus::MarketPushed => self.pushed_at = Some(now),
            ShipmentStatus::Shipped => self.shipped_at = Some(now),
            ShipmentStatus::Delivered => self.delivered_at = Some(now),
            _ => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn transition_push(
        &mut self,
        target: MarketPushStatus,
        now: i64,
    ) -> Result<(), InvalidTransition> {
        advance(&mut self.market_push_status, target)?;
        match target {
            MarketPushStatus::Pushing => self.last_attempted_at = Some(now),
            MarketPushStatus::Failed => self.retry_count += 1,
            MarketPushStatus::Success => {
                self.next_retry_at = None;
                self.last_error = None;
            }
            MarketPushStatus::Pending => {}
        }
        self.updated_at = now;
        Ok(())
    }

    /// Tracking number already delivered to the marketplace
    pub fn has_pushed_tracking(&self) -> bool {
        self.tracking_number.is_some() && self.market_push_status == MarketPushStatus::Success
    }

    /// Where a FAILED shipment resumes
    pub fn resume_status(&self) -> ShipmentStatus {
        if self.tracking_number.is_some() {
            ShipmentStatus::MarketPushRequested
        } else {
            ShipmentStatus::InvoiceRequested
        }
    }

    /// Eligible for automatic push retry
    pub fn is_retry_due(&self, now: i64, max_retries: i32) -> bool {
        self.active
            && self.status == ShipmentStatus::Failed
            && self.market_push_status == MarketPushStatus::Failed
            && self.retry_count < max_retries
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// FAILED with no automatic retry coming: budget spent, a fatal push
    /// error, or a failed invoice
    pub fn needs_manual_review(&self, max_retries: i32) -> bool {
        self.active
            && self.status == ShipmentStatus::Failed
            && (self.retry_count >= max_retries || self.next_retry_at.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::RawOrder;
    use crate::models::state::assert_table_conformance;
    use rust_decimal::Decimal;

    fn shipment() -> Shipment {
        let order = MarketOrder::from_raw(
            "t1",
            Uuid::new_v4(),
            "COUPANG",
            RawOrder {
                marketplace_order_id: "MO-1".into(),
                ordered_at: 0,
                buyer_name: None,
                shipping_fee: Decimal::ZERO,
                items: vec![],
            },
        );
        Shipment::for_order(&order)
    }

    #[test]
    fn test_shipment_table_conformance() {
        assert_table_conformance::<ShipmentStatus>();
        assert_table_conformance::<MarketPushStatus>();
    }

    #[test]
    fn test_failed_returns_only_to_request_states() {
        assert_eq!(
            ShipmentStatus::Failed.valid_transitions(),
            vec![
                ShipmentStatus::InvoiceRequested,
                ShipmentStatus::MarketPushRequested
            ]
        );
        assert!(ShipmentStatus::Delivered.is_terminal());
        assert!(!ShipmentStatus::Ready.can_transition_to(ShipmentStatus::Failed));
    }

    #[test]
    fn test_push_failure_counts_retry() {
        let mut s = shipment();
        s.transition_push(MarketPushStatus::Pushing, 5).unwrap();
        s.transition_push(MarketPushStatus::Failed, 6).unwrap();
        assert_eq!(s.retry_count, 1);
        assert_eq!(s.last_attempted_at, Some(5));
        assert!(s.transition_push(MarketPushStatus::Success, 7).is_err());
        assert_eq!(s.market_push_status, MarketPushStatus::Failed);
    }

    #[test]
    fn test_retry_budget_excludes_from_automation() {
        let mut s = shipment();
        s.status = ShipmentStatus::Failed;
        s.market_push_status = MarketPushStatus::Failed;
        s.next_retry_at = Some(0);
        s.retry_count = 4;
        assert!(s.is_retry_due(10, 5));
        assert!(!s.needs_manual_review(5));

        s.retry_count = 5;
        assert!(!s.is_retry_due(10, 5));
        assert!(s.needs_manual_review(5));
    }

    #[test]
    fn test_failure_without_retry_time_needs_review() {
        let mut s = shipment();
        s.status = ShipmentStatus::Failed;
        s.market_push_status = MarketPushStatus::Failed;
        s.retry_count = 1;
        s.next_retry_at = None;
        assert!(!s.is_retry_due(10, 5));
        assert!(s.needs_manual_review(5));

        s.active = false;
        assert!(!s.needs_manual_review(5));
    }

    #[test]
    fn test_resume_status_depends_on_tracking() {
        let mut s = shipment();
        assert_eq!(s.resume_status(), ShipmentStatus::InvoiceRequested);
        s.tracking_number = Some("TRK-1".into());
        assert_eq!(s.resume_status(), ShipmentStatus::MarketPushRequested);
    }
}
