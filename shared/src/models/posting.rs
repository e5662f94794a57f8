//! ERP posting documents and their submission lifecycle

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::{InvalidTransition, ParseEnumError, StateMachine, advance};
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostingType {
    Sales,
    ShippingFee,
    Cancel,
    Commission,
    PgFee,
    Receipt,
}

impl PostingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "SALES",
            Self::ShippingFee => "SHIPPING_FEE",
            Self::Cancel => "CANCEL",
            Self::Commission => "COMMISSION",
            Self::PgFee => "PG_FEE",
            Self::Receipt => "RECEIPT",
        }
    }

    /// Receipts record a cash movement and carry no VAT
    pub fn is_vat_exempt(&self) -> bool {
        matches!(self, Self::Receipt)
    }
}

impl fmt::Display for PostingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SALES" => Ok(Self::Sales),
            "SHIPPING_FEE" => Ok(Self::ShippingFee),
            "CANCEL" => Ok(Self::Cancel),
            "COMMISSION" => Ok(Self::Commission),
            "PG_FEE" => Ok(Self::PgFee),
            "RECEIPT" => Ok(Self::Receipt),
            _ => Err(ParseEnumError::new("posting type", s)),
        }
    }
}

/// What a posting was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostingSource {
    Order,
    Settlement,
}

impl PostingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "ORDER",
            Self::Settlement => "SETTLEMENT",
        }
    }
}

impl FromStr for PostingSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORDER" => Ok(Self::Order),
            "SETTLEMENT" => Ok(Self::Settlement),
            _ => Err(ParseEnumError::new("posting source", s)),
        }
    }
}

/// Posting lifecycle
///
/// CREATED -> PENDING_MAPPING -> READY_TO_POST -> POSTING_REQUESTED -> {POSTED, FAILED}.
/// CREATED may skip straight to READY_TO_POST; FAILED may be requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostingStatus {
    Created,
    PendingMapping,
    ReadyToPost,
    PostingRequested,
    Posted,
    Failed,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::PendingMapping => "PENDING_MAPPING",
            Self::ReadyToPost => "READY_TO_POST",
            Self::PostingRequested => "POSTING_REQUESTED",
            Self::Posted => "POSTED",
            Self::Failed => "FAILED",
        }
    }
}

impl StateMachine for PostingStatus {
    const ENTITY: &'static str = "posting";
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::PendingMapping,
        Self::ReadyToPost,
        Self::PostingRequested,
        Self::Posted,
        Self::Failed,
    ];

    fn can_transition_to(&self, target: Self) -> bool {
        use PostingStatus::*;
        matches!(
            (self, target),
            (Created, PendingMapping)
                | (Created, ReadyToPost)
                | (PendingMapping, ReadyToPost)
                | (ReadyToPost, PostingRequested)
                | (PostingRequested, Posted)
                | (PostingRequested, Failed)
                | (Failed, ReadyToPost)
        )
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PENDING_MAPPING" => Ok(Self::PendingMapping),
            "READY_TO_POST" => Ok(Self::ReadyToPost),
            "POSTING_REQUESTED" => Ok(Self::PostingRequested),
            "POSTED" => Ok(Self::Posted),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("posting status", s)),
        }
    }
}

/// Supply / VAT split of a VAT-inclusive amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VatBreakdown {
    pub supply_amount: Decimal,
    pub vat_amount: Decimal,
    pub total: Decimal,
}

impl VatBreakdown {
    /// No VAT: the whole amount is supply
    pub fn exempt(total: Decimal) -> Self {
        Self {
            supply_amount: total,
            vat_amount: Decimal::ZERO,
            total,
        }
    }

    pub fn add(&mut self, other: &VatBreakdown) {
        self.supply_amount += other.supply_amount;
        self.vat_amount += other.vat_amount;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingLine {
    pub line_no: u32,
    pub item_code: String,
    pub description: String,
    pub quantity: i32,
    pub warehouse_code: Option<String>,
    /// `productId:sku` for order lines, a settlement label otherwise
    pub reference: String,
    pub amounts: VatBreakdown,
}

/// One ERP sales document. Contains no wall-clock data so rebuilding it from
/// the same inputs yields the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingDocument {
    pub idempotency_key: String,
    pub tenant_id: String,
    pub posting_type: PostingType,
    pub source: PostingSource,
    pub reference_id: Uuid,
    /// Marketplace order id, or the settlement period label
    pub external_reference: String,
    /// Marketplace code, used as the ERP counterparty
    pub counterparty: String,
    pub document_date: i64,
    pub lines: Vec<PostingLine>,
    pub totals: VatBreakdown,
}

impl PostingDocument {
    /// Canonical serialized form
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Lowercase hex SHA-256 of `tenant:reference:POSTING_TYPE`
pub fn idempotency_key(tenant_id: &str, reference_id: &Uuid, posting_type: PostingType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{tenant_id}:{reference_id}:{}", posting_type.as_str()));
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub posting_type: PostingType,
    pub source: PostingSource,
    pub reference_id: Uuid,
    pub status: PostingStatus,
    pub document: Option<PostingDocument>,
    pub supply_amount: Decimal,
    pub vat_amount: Decimal,
    pub total_amount: Decimal,
    /// Document number assigned by the ERP once POSTED
    pub erp_reference: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Numeric `ErrorCode` of the last failure
    pub last_error_code: Option<u16>,
    pub active: bool,
    pub requested_at: Option<i64>,
    pub posted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Posting {
    pub fn new(
        tenant_id: &str,
        source: PostingSource,
        reference_id: Uuid,
        posting_type: PostingType,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            idempotency_key: idempotency_key(tenant_id, &reference_id, posting_type),
            posting_type,
            source,
            reference_id,
            status: PostingStatus::Created,
            document: None,
            supply_amount: Decimal::ZERO,
            vat_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            erp_reference: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
            active: true,
            requested_at: None,
            posted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_document(document: PostingDocument) -> Self {
        let mut posting = Self::new(
            &document.tenant_id,
            document.source,
            document.reference_id,
            document.posting_type,
        );
        posting.attach_document(document);
        posting
    }

    pub fn attach_document(&mut self, document: PostingDocument) {
        self.supply_amount = document.totals.supply_amount;
        self.vat_amount = document.totals.vat_amount;
        self.total_amount = document.totals.total;
        self.document = Some(document);
    }

    pub fn transition(&mut self, target: PostingStatus, now: i64) -> Result<(), InvalidTransition> {
        advance(&mut self.status, target)?;
        match target {
            PostingStatus::PostingRequested => self.requested_at = Some(now),
            PostingStatus::Posted => {
                self.posted_at = Some(now);
                self.next_retry_at = None;
                self.last_error = None;
                self.last_error_code = None;
            }
            PostingStatus::Failed => self.retry_count += 1,
            PostingStatus::ReadyToPost => self.next_retry_at = None,
            PostingStatus::Created | PostingStatus::PendingMapping => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_posted(&self) -> bool {
        self.status == PostingStatus::Posted
    }

    pub fn is_retry_due(&self, now: i64) -> bool {
        self.active
            && self.status == PostingStatus::Failed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::assert_table_conformance;
    use rust_decimal_macros::dec;

    #[test]
    fn test_posting_table_conformance() {
        assert_table_conformance::<PostingStatus>();
    }

    #[test]
    fn test_posted_is_terminal() {
        assert!(PostingStatus::Posted.is_terminal());
        assert!(!PostingStatus::Failed.is_terminal());
        assert!(!PostingStatus::Posted.can_transition_to(PostingStatus::ReadyToPost));
        assert!(!PostingStatus::Posted.can_transition_to(PostingStatus::Failed));
    }

    #[test]
    fn test_idempotency_key_is_stable_and_type_specific() {
        let order_id = Uuid::new_v4();
        let a = idempotency_key("t1", &order_id, PostingType::Sales);
        let b = idempotency_key("t1", &order_id, PostingType::Sales);
        let c = idempotency_key("t1", &order_id, PostingType::ShippingFee);
        let d = idempotency_key("t2", &order_id, PostingType::Sales);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn test_failure_increments_retry_count() {
        let mut posting = Posting::new("t1", PostingSource::Order, Uuid::new_v4(), PostingType::Sales);
        posting.transition(PostingStatus::ReadyToPost, 1).unwrap();
        posting.transition(PostingStatus::PostingRequested, 2).unwrap();
        posting.transition(PostingStatus::Failed, 3).unwrap();
        assert_eq!(posting.retry_count, 1);
        assert_eq!(posting.requested_at, Some(2));

        posting.next_retry_at = Some(10);
        assert!(posting.is_retry_due(10));
        posting.transition(PostingStatus::ReadyToPost, 11).unwrap();
        assert_eq!(posting.next_retry_at, None);
    }

    #[test]
    fn test_exempt_breakdown() {
        let v = VatBreakdown::exempt(dec!(5000));
        assert_eq!(v.supply_amount, dec!(5000));
        assert_eq!(v.vat_amount, Decimal::ZERO);
    }
}
