//! Marketplace payout reconciliation batches

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::{InvalidTransition, ParseEnumError, StateMachine, advance};
use crate::util::now_millis;

/// Settlement batch lifecycle
///
/// COLLECTED -> VALIDATED -> POSTING_READY -> POSTED -> CLOSED.
/// FAILED from the first three; FAILED only back to COLLECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Collected,
    Validated,
    PostingReady,
    Posted,
    Closed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collected => "COLLECTED",
            Self::Validated => "VALIDATED",
            Self::PostingReady => "POSTING_READY",
            Self::Posted => "POSTED",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        }
    }
}

impl StateMachine for SettlementStatus {
    const ENTITY: &'static str = "settlement batch";
    const ALL: &'static [Self] = &[
        Self::Collected,
        Self::Validated,
        Self::PostingReady,
        Self::Posted,
        Self::Closed,
        Self::Failed,
    ];

    fn can_transition_to(&self, target: Self) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, target),
            (Collected, Validated)
                | (Collected, Failed)
                | (Validated, PostingReady)
                | (Validated, Failed)
                | (PostingReady, Posted)
                | (PostingReady, Failed)
                | (Posted, Closed)
                | (Failed, Collected)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COLLECTED" => Ok(Self::Collected),
            "VALIDATED" => Ok(Self::Validated),
            "POSTING_READY" => Ok(Self::PostingReady),
            "POSTED" => Ok(Self::Posted),
            "CLOSED" => Ok(Self::Closed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("settlement status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementCycle {
    Daily,
    Weekly,
    Monthly,
}

impl SettlementCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }
}

impl fmt::Display for SettlementCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementCycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            _ => Err(ParseEnumError::new("settlement cycle", s)),
        }
    }
}

/// Inclusive date range covered by a payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SettlementPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn label(&self) -> String {
        format!("{}..{}", self.start, self.end)
    }
}

/// One order's row in a marketplace payout feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub marketplace_order_id: String,
    pub sales_amount: Decimal,
    pub commission: Decimal,
    pub pg_fee: Decimal,
    pub shipping_settled: Decimal,
    pub payout: Decimal,
}

/// Marketplace payout feed for one cycle and period
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketplaceSettlementData {
    pub gross_sales: Decimal,
    pub commission: Decimal,
    pub pg_fee: Decimal,
    pub shipping_charged: Decimal,
    pub shipping_settled: Decimal,
    /// Amount the marketplace says it pays out
    pub payout: Decimal,
    pub lines: Vec<SettlementLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: Uuid,
    pub tenant_id: String,
    pub marketplace: String,
    pub cycle: SettlementCycle,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: SettlementStatus,

    // Declared by the marketplace
    pub gross_sales: Decimal,
    pub commission: Decimal,
    pub pg_fee: Decimal,
    pub shipping_charged: Decimal,
    pub shipping_settled: Decimal,
    pub actual_payout: Decimal,
    /// gross - commission - PG fee + shipping settled, from declared figures
    pub net_payout: Decimal,

    // Computed from matched orders
    pub matched_gross_sales: Decimal,
    pub matched_commission: Decimal,
    pub matched_pg_fee: Decimal,
    pub matched_shipping_settled: Decimal,
    pub expected_payout: Decimal,

    pub matched_count: i32,
    pub unmatched_count: i32,
    pub unmatched_order_ids: Vec<String>,
    /// Per-field discrepancy recorded when validation fails
    pub discrepancy: Option<serde_json::Value>,

    pub attempt_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub active: bool,
    pub validated_at: Option<i64>,
    pub posted_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SettlementBatch {
    pub fn new(
        tenant_id: &str,
        marketplace: &str,
        cycle: SettlementCycle,
        period: SettlementPeriod,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            marketplace: marketplace.to_string(),
            cycle,
            period_start: period.start,
            period_end: period.end,
            status: SettlementStatus::Collected,
            gross_sales: Decimal::ZERO,
            commission: Decimal::ZERO,
            pg_fee: Decimal::ZERO,
            shipping_charged: Decimal::ZERO,
            shipping_settled: Decimal::ZERO,
            actual_payout: Decimal::ZERO,
            net_payout: Decimal::ZERO,
            matched_gross_sales: Decimal::ZERO,
            matched_commission: Decimal::ZERO,
            matched_pg_fee: Decimal::ZERO,
            matched_shipping_settled: Decimal::ZERO,
            expected_payout: Decimal::ZERO,
            matched_count: 0,
            unmatched_count: 0,
            unmatched_order_ids: Vec::new(),
            discrepancy: None,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            active: true,
            validated_at: None,
            posted_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn period(&self) -> SettlementPeriod {
        SettlementPeriod {
            start: self.period_start,
            end: self.period_end,
        }
    }

    /// Replace declared figures and clear match results before (re)matching
    pub fn load_declared(&mut self, data: &MarketplaceSettlementData) {
        self.gross_sales = data.gross_sales;
        self.commission = data.commission;
        self.pg_fee = data.pg_fee;
        self.shipping_charged = data.shipping_charged;
        self.shipping_settled = data.shipping_settled;
        self.actual_payout = data.payout;
        self.net_payout = data.gross_sales - data.commission - data.pg_fee + data.shipping_settled;
        self.matched_gross_sales = Decimal::ZERO;
        self.matched_commission = Decimal::ZERO;
        self.matched_pg_fee = Decimal::ZERO;
        self.matched_shipping_settled = Decimal::ZERO;
        self.expected_payout = Decimal::ZERO;
        self.matched_count = 0;
        self.unmatched_count = 0;
        self.unmatched_order_ids.clear();
        self.discrepancy = None;
    }

    /// Add one matched line; `order_amount` is the order-side gross
    pub fn record_match(&mut self, order_amount: Decimal, line: &SettlementLine) {
        self.matched_gross_sales += order_amount;
        self.matched_commission += line.commission;
        self.matched_pg_fee += line.pg_fee;
        self.matched_shipping_settled += line.shipping_settled;
        self.expected_payout = self.matched_gross_sales - self.matched_commission
            - self.matched_pg_fee
            + self.matched_shipping_settled;
        self.matched_count += 1;
    }

    pub fn record_unmatched(&mut self, marketplace_order_id: &str) {
        self.unmatched_count += 1;
        self.unmatched_order_ids.push(marketplace_order_id.to_string());
    }

    pub fn transition(&mut self, target: SettlementStatus, now: i64) -> Result<(), InvalidTransition> {
        advance(&mut self.status, target)?;
        match target {
            SettlementStatus::Validated => self.validated_at = Some(now),
            SettlementStatus::Posted => {
                self.posted_at = Some(now);
                self.next_retry_at = None;
            }
            SettlementStatus::Closed => self.closed_at = Some(now),
            SettlementStatus::Failed => self.attempt_count += 1,
            SettlementStatus::Collected => {
                self.next_retry_at = None;
                self.validated_at = None;
            }
            SettlementStatus::PostingReady => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_retry_due(&self, now: i64) -> bool {
        self.active
            && matches!(
                self.status,
                SettlementStatus::Failed | SettlementStatus::PostingReady
            )
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::assert_table_conformance;
    use rust_decimal_macros::dec;

    fn batch() -> SettlementBatch {
        let period = SettlementPeriod::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .unwrap();
        SettlementBatch::new("t1", "COUPANG", SettlementCycle::Monthly, period)
    }

    #[test]
    fn test_settlement_table_conformance() {
        assert_table_conformance::<SettlementStatus>();
    }

    #[test]
    fn test_failed_only_returns_to_collected() {
        let mut b = batch();
        b.transition(SettlementStatus::Failed, 1).unwrap();
        let err = b.transition(SettlementStatus::Validated, 2).unwrap_err();
        assert_eq!(err.to, "VALIDATED");
        assert_eq!(b.status, SettlementStatus::Failed);
        b.transition(SettlementStatus::Collected, 3).unwrap();
        assert_eq!(b.attempt_count, 1);
    }

    #[test]
    fn test_closed_is_only_reachable_from_posted() {
        assert!(SettlementStatus::Closed.is_terminal());
        for from in SettlementStatus::ALL {
            let allowed = from.can_transition_to(SettlementStatus::Closed);
            assert_eq!(allowed, *from == SettlementStatus::Posted, "{from}");
        }
    }

    #[test]
    fn test_match_accounting() {
        let mut b = batch();
        b.load_declared(&MarketplaceSettlementData {
            gross_sales: dec!(20000),
            commission: dec!(2000),
            pg_fee: dec!(300),
            shipping_charged: dec!(3000),
            shipping_settled: dec!(2500),
            payout: dec!(20200),
            lines: vec![],
        });
        assert_eq!(b.net_payout, dec!(20200));

        let line = SettlementLine {
            marketplace_order_id: "MO-1".into(),
            sales_amount: dec!(20000),
            commission: dec!(2000),
            pg_fee: dec!(300),
            shipping_settled: dec!(2500),
            payout: dec!(20200),
        };
        b.record_match(dec!(20000), &line);
        b.record_unmatched("MO-404");
        assert_eq!(b.expected_payout, dec!(20200));
        assert_eq!(b.matched_count, 1);
        assert_eq!(b.unmatched_order_ids, vec!["MO-404".to_string()]);
    }

    #[test]
    fn test_period_requires_ordered_dates() {
        let d1 = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(SettlementPeriod::new(d1, d2).is_none());
        assert_eq!(
            SettlementPeriod::new(d2, d1).unwrap().label(),
            "2026-01-01..2026-02-01"
        );
    }
}
