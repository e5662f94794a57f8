//! ERP posting documents
//!
//! Building is pure: the same order, mappings and VAT rate always produce the
//! same documents, byte for byte, with the same idempotency keys.

use chrono::NaiveTime;
use rust_decimal::Decimal;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{
    ErpItemRef, MarketOrder, OrderItem, PostingDocument, PostingLine, PostingSource, PostingType,
    SettlementBatch, VatBreakdown, idempotency_key,
};
use std::collections::HashMap;

use crate::config::PostingItemCodes;

/// `floor(total / (1 + rate))`
pub fn calculate_supply_amount(total_with_vat: Decimal, vat_rate: Decimal) -> Decimal {
    (total_with_vat / (Decimal::ONE + vat_rate)).floor()
}

/// Whatever the supply amount leaves over, so the two always sum to the total
pub fn calculate_vat_amount(total_with_vat: Decimal, vat_rate: Decimal) -> Decimal {
    total_with_vat - calculate_supply_amount(total_with_vat, vat_rate)
}

pub fn vat_breakdown(total_with_vat: Decimal, vat_rate: Decimal) -> VatBreakdown {
    let supply_amount = calculate_supply_amount(total_with_vat, vat_rate);
    VatBreakdown {
        supply_amount,
        vat_amount: total_with_vat - supply_amount,
        total: total_with_vat,
    }
}

#[derive(Debug, Clone)]
pub struct PostingBuilder {
    vat_rate: Decimal,
    items: PostingItemCodes,
}

impl PostingBuilder {
    pub fn new(vat_rate: Decimal, items: PostingItemCodes) -> Self {
        Self { vat_rate, items }
    }

    pub fn vat_rate(&self) -> Decimal {
        self.vat_rate
    }

    /// SALES, CANCEL and SHIPPING_FEE documents for an order, each only when
    /// it has something to post. Fails if any line lacks a mapping.
    pub fn build_order_documents(
        &self,
        order: &MarketOrder,
        mappings: &HashMap<String, ErpItemRef>,
    ) -> AppResult<Vec<PostingDocument>> {
        let mut unmapped: Vec<String> = Vec::new();
        for item in &order.items {
            let key = item.mapping_key();
            if !mappings.contains_key(&key) && !unmapped.contains(&key) {
                unmapped.push(key);
            }
        }
        if !unmapped.is_empty() {
            return Err(AppError::mapping_required(unmapped));
        }

        let mut documents = Vec::with_capacity(3);
        let active: Vec<&OrderItem> = order.active_items().collect();
        if !active.is_empty() {
            documents.push(self.item_document(order, PostingType::Sales, &active, mappings));
        }
        let cancelled: Vec<&OrderItem> = order.cancelled_items().collect();
        if !cancelled.is_empty() {
            documents.push(self.item_document(order, PostingType::Cancel, &cancelled, mappings));
        }
        if order.shipping_fee > Decimal::ZERO {
            let line = self.fee_line(
                1,
                &self.items.shipping_fee,
                "Shipping fee",
                &order.marketplace_order_id,
                order.shipping_fee,
                PostingType::ShippingFee,
            );
            documents.push(self.order_document(order, PostingType::ShippingFee, vec![line]));
        }

        if documents.is_empty() {
            return Err(AppError::with_message(
                ErrorCode::OrderEmpty,
                format!("order {} has nothing to post", order.marketplace_order_id),
            ));
        }
        Ok(documents)
    }

    /// COMMISSION, PG_FEE and RECEIPT documents for a settlement batch,
    /// skipping zero amounts
    pub fn build_settlement_documents(&self, batch: &SettlementBatch) -> Vec<PostingDocument> {
        let label = batch.period().label();
        let document_date = batch
            .period_end
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_millis();

        [
            (PostingType::Commission, &self.items.commission, "Marketplace commission", batch.commission),
            (PostingType::PgFee, &self.items.pg_fee, "Payment gateway fee", batch.pg_fee),
            (PostingType::Receipt, &self.items.receipt, "Marketplace payout", batch.actual_payout),
        ]
        .into_iter()
        .filter(|(_, _, _, amount)| !amount.is_zero())
        .map(|(posting_type, item_code, description, amount)| {
            let line = self.fee_line(1, item_code, description, &label, amount, posting_type);
            PostingDocument {
                idempotency_key: idempotency_key(&batch.tenant_id, &batch.id, posting_type),
                tenant_id: batch.tenant_id.clone(),
                posting_type,
                source: PostingSource::Settlement,
                reference_id: batch.id,
                external_reference: label.clone(),
                counterparty: batch.marketplace.clone(),
                document_date,
                totals: line.amounts,
                lines: vec![line],
            }
        })
        .collect()
    }

    fn item_document(
        &self,
        order: &MarketOrder,
        posting_type: PostingType,
        items: &[&OrderItem],
        mappings: &HashMap<String, ErpItemRef>,
    ) -> PostingDocument {
        let lines = items
            .iter()
            .zip(1u32..)
            .filter_map(|(item, line_no)| {
                let key = item.mapping_key();
                let erp = mappings.get(&key)?;
                Some(PostingLine {
                    line_no,
                    item_code: erp.item_code.clone(),
                    description: item.name.clone(),
                    quantity: item.quantity,
                    warehouse_code: erp.warehouse_code.clone(),
                    reference: key,
                    amounts: vat_breakdown(item.total_with_vat, self.vat_rate),
                })
            })
            .collect();
        self.order_document(order, posting_type, lines)
    }

    fn fee_line(
        &self,
        line_no: u32,
        item_code: &str,
        description: &str,
        reference: &str,
        amount: Decimal,
        posting_type: PostingType,
    ) -> PostingLine {
        let amounts = if posting_type.is_vat_exempt() {
            VatBreakdown::exempt(amount)
        } else {
            vat_breakdown(amount, self.vat_rate)
        };
        PostingLine {
            line_no,
            item_code: item_code.to_string(),
            description: description.to_string(),
            quantity: 1,
            warehouse_code: None,
            reference: reference.to_string(),
            amounts,
        }
    }

    fn order_document(
        &self,
        order: &MarketOrder,
        posting_type: PostingType,
        lines: Vec<PostingLine>,
    ) -> PostingDocument {
        let mut totals = VatBreakdown::default();
        for line in &lines {
            totals.add(&line.amounts);
        }
        PostingDocument {
            idempotency_key: idempotency_key(&order.tenant_id, &order.id, posting_type),
            tenant_id: order.tenant_id.clone(),
            posting_type,
            source: PostingSource::Order,
            reference_id: order.id,
            external_reference: order.marketplace_order_id.clone(),
            counterparty: order.marketplace.clone(),
            document_date: order.ordered_at,
            lines,
            totals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use shared::models::{RawOrder, RawOrderItem, SettlementCycle, SettlementPeriod};
    use uuid::Uuid;

    const RATE: Decimal = dec!(0.1);

    fn builder() -> PostingBuilder {
        PostingBuilder::new(RATE, PostingItemCodes::default())
    }

    fn line(product: &str, sku: &str, total: Decimal, cancelled: bool) -> RawOrderItem {
        RawOrderItem {
            product_id: product.into(),
            sku: sku.into(),
            name: format!("{product} name"),
            quantity: 1,
            unit_price: total,
            total_with_vat: total,
            cancelled,
        }
    }

    fn order(items: Vec<RawOrderItem>, shipping_fee: Decimal) -> MarketOrder {
        MarketOrder::from_raw(
            "t1",
            Uuid::new_v4(),
            "COUPANG",
            RawOrder {
                marketplace_order_id: "MO-1".into(),
                ordered_at: 1_700_000_000_000,
                buyer_name: None,
                shipping_fee,
                items,
            },
        )
    }

    fn mapped(keys: &[&str]) -> HashMap<String, ErpItemRef> {
        keys.iter()
            .map(|k| {
                (
                    k.to_string(),
                    ErpItemRef {
                        item_code: format!("ERP-{k}"),
                        item_name: None,
                        warehouse_code: Some("WH1".into()),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_eleven_thousand_splits_ten_thousand_and_one() {
        assert_eq!(calculate_supply_amount(dec!(11000), RATE), dec!(10000));
        assert_eq!(calculate_vat_amount(dec!(11000), RATE), dec!(1000));
    }

    #[test]
    fn test_supply_plus_vat_is_total_and_supply_is_monotonic() {
        let mut previous = Decimal::ZERO;
        for cents in (0..=3_000_000i64).step_by(7) {
            let t = Decimal::new(cents, 2);
            let supply = calculate_supply_amount(t, RATE);
            assert_eq!(supply + calculate_vat_amount(t, RATE), t);
            assert!(supply >= previous, "supply decreased at {t}");
            previous = supply;
        }
    }

    #[test]
    fn test_floor_then_subtract_rounding() {
        // 1 / 1.1 = 0.909.. -> supply 0, vat 1
        assert_eq!(calculate_supply_amount(dec!(1), RATE), dec!(0));
        assert_eq!(calculate_vat_amount(dec!(1), RATE), dec!(1));
        // 10999 / 1.1 = 9999.09.. -> 9999 / 1000
        assert_eq!(calculate_supply_amount(dec!(10999), RATE), dec!(9999));
        assert_eq!(calculate_vat_amount(dec!(10999), RATE), dec!(1000));
    }

    #[test]
    fn test_order_types_are_separate_documents() {
        let o = order(
            vec![line("P1", "S1", dec!(11000), false), line("P2", "S2", dec!(5500), true)],
            dec!(3000),
        );
        let docs = builder().build_order_documents(&o, &mapped(&["P1:S1", "P2:S2"])).unwrap();
        let types: Vec<PostingType> = docs.iter().map(|d| d.posting_type).collect();
        assert_eq!(types, vec![PostingType::Sales, PostingType::Cancel, PostingType::ShippingFee]);

        let sales = &docs[0];
        assert_eq!(sales.lines.len(), 1);
        assert_eq!(sales.totals.supply_amount, dec!(10000));
        assert_eq!(sales.lines[0].item_code, "ERP-P1:S1");
        assert_eq!(sales.lines[0].warehouse_code.as_deref(), Some("WH1"));

        let shipping = &docs[2];
        assert_eq!(shipping.totals.total, dec!(3000));
        assert_eq!(shipping.lines[0].item_code, "SHIPPING-FEE");

        let keys: std::collections::HashSet<_> = docs.iter().map(|d| &d.idempotency_key).collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let o = order(vec![line("P1", "S1", dec!(12345), false)], dec!(2500));
        let m = mapped(&["P1:S1"]);
        let first = builder().build_order_documents(&o, &m).unwrap();
        let second = builder().build_order_documents(&o, &m).unwrap();
        assert_eq!(first, second);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.canonical_bytes(), b.canonical_bytes());
            assert_eq!(a.idempotency_key, idempotency_key("t1", &o.id, a.posting_type));
        }
    }

    #[test]
    fn test_one_unmapped_line_fails_with_its_key() {
        let o = order(
            vec![line("P1", "S1", dec!(11000), false), line("P2", "S2", dec!(2200), false)],
            Decimal::ZERO,
        );
        let err = builder().build_order_documents(&o, &mapped(&["P1:S1"])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MappingRequired);
        assert_eq!(err.unmapped_keys(), vec!["P2:S2".to_string()]);
    }

    #[test]
    fn test_empty_order_is_rejected() {
        let o = order(vec![], Decimal::ZERO);
        let err = builder().build_order_documents(&o, &HashMap::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::OrderEmpty);
    }

    #[test]
    fn test_settlement_documents() {
        let period = SettlementPeriod::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
        )
        .unwrap();
        let mut batch = SettlementBatch::new("t1", "COUPANG", SettlementCycle::Weekly, period);
        batch.commission = dec!(1100);
        batch.pg_fee = Decimal::ZERO;
        batch.actual_payout = dec!(98900);

        let docs = builder().build_settlement_documents(&batch);
        let types: Vec<PostingType> = docs.iter().map(|d| d.posting_type).collect();
        assert_eq!(types, vec![PostingType::Commission, PostingType::Receipt]);
        assert_eq!(docs[0].totals.supply_amount, dec!(1000));
        assert_eq!(docs[0].totals.vat_amount, dec!(100));
        assert_eq!(docs[1].totals.vat_amount, Decimal::ZERO);
        assert_eq!(docs[1].totals.supply_amount, dec!(98900));
        assert!(docs.iter().all(|d| d.source == PostingSource::Settlement));
        assert_eq!(docs[0].external_reference, "2026-03-01..2026-03-07");
    }
}
