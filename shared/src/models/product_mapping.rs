//! Marketplace product/SKU to ERP item correspondence

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::mapping_key;
use super::state::ParseEnumError;
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    Unmapped,
    /// Produced by similarity scoring; never satisfies posting
    Suggested,
    Mapped,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmapped => "UNMAPPED",
            Self::Suggested => "SUGGESTED",
            Self::Mapped => "MAPPED",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNMAPPED" => Ok(Self::Unmapped),
            "SUGGESTED" => Ok(Self::Suggested),
            "MAPPED" => Ok(Self::Mapped),
            _ => Err(ParseEnumError::new("mapping status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    Auto,
    Manual,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Self::Auto),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(ParseEnumError::new("mapping type", s)),
        }
    }
}

/// Identifies one mapping slot. `store_id = None` is the store-independent fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingScope {
    pub tenant_id: String,
    pub store_id: Option<Uuid>,
    pub marketplace: String,
    pub product_id: String,
    pub sku: String,
}

impl MappingScope {
    pub fn key(&self) -> String {
        mapping_key(&self.product_id, &self.sku)
    }

    /// Same product/SKU with the store dropped
    pub fn fallback(&self) -> Self {
        Self {
            store_id: None,
            ..self.clone()
        }
    }
}

/// Resolved ERP item fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpItemRef {
    pub item_code: String,
    pub item_name: Option<String>,
    pub warehouse_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMapping {
    pub id: Uuid,
    pub tenant_id: String,
    pub store_id: Option<Uuid>,
    pub marketplace: String,
    pub marketplace_product_id: String,
    pub marketplace_sku: String,
    pub erp_item_code: Option<String>,
    pub erp_item_name: Option<String>,
    pub erp_warehouse_code: Option<String>,
    pub status: MappingStatus,
    pub mapping_type: MappingType,
    /// Match confidence in [0, 1]
    pub confidence: f64,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProductMapping {
    fn build(
        scope: &MappingScope,
        item: Option<ErpItemRef>,
        status: MappingStatus,
        mapping_type: MappingType,
        confidence: f64,
    ) -> Self {
        let now = now_millis();
        let (code, name, warehouse) = match item {
            Some(i) => (Some(i.item_code), i.item_name, i.warehouse_code),
            None => (None, None, None),
        };
        Self {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id.clone(),
            store_id: scope.store_id,
            marketplace: scope.marketplace.clone(),
            marketplace_product_id: scope.product_id.clone(),
            marketplace_sku: scope.sku.clone(),
            erp_item_code: code,
            erp_item_name: name,
            erp_warehouse_code: warehouse,
            status,
            mapping_type,
            confidence: confidence.clamp(0.0, 1.0),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Operator-entered mapping, always confidence 1.0
    pub fn manual(scope: &MappingScope, item: ErpItemRef) -> Self {
        Self::build(scope, Some(item), MappingStatus::Mapped, MappingType::Manual, 1.0)
    }

    pub fn suggested(scope: &MappingScope, item: ErpItemRef, confidence: f64) -> Self {
        Self::build(
            scope,
            Some(item),
            MappingStatus::Suggested,
            MappingType::Auto,
            confidence,
        )
    }

    pub fn unmapped(scope: &MappingScope) -> Self {
        Self::build(scope, None, MappingStatus::Unmapped, MappingType::Auto, 0.0)
    }

    pub fn scope(&self) -> MappingScope {
        MappingScope {
            tenant_id: self.tenant_id.clone(),
            store_id: self.store_id,
            marketplace: self.marketplace.clone(),
            product_id: self.marketplace_product_id.clone(),
            sku: self.marketplace_sku.clone(),
        }
    }

    pub fn key(&self) -> String {
        mapping_key(&self.marketplace_product_id, &self.marketplace_sku)
    }

    /// Only an active MAPPED mapping with an item code satisfies posting
    pub fn is_mapped(&self) -> bool {
        self.active && self.status == MappingStatus::Mapped && self.erp_item_code.is_some()
    }

    pub fn is_manual(&self) -> bool {
        self.mapping_type == MappingType::Manual
    }

    pub fn erp_item(&self) -> Option<ErpItemRef> {
        self.erp_item_code.as_ref().map(|code| ErpItemRef {
            item_code: code.clone(),
            item_name: self.erp_item_name.clone(),
            warehouse_code: self.erp_warehouse_code.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> MappingScope {
        MappingScope {
            tenant_id: "t1".into(),
            store_id: Some(Uuid::new_v4()),
            marketplace: "COUPANG".into(),
            product_id: "P-1".into(),
            sku: "SKU-1".into(),
        }
    }

    fn item() -> ErpItemRef {
        ErpItemRef {
            item_code: "ERP-001".into(),
            item_name: Some("Widget".into()),
            warehouse_code: None,
        }
    }

    #[test]
    fn test_suggestion_never_counts_as_mapped() {
        let suggested = ProductMapping::suggested(&scope(), item(), 0.93);
        assert!(!suggested.is_mapped());

        let manual = ProductMapping::manual(&scope(), item());
        assert!(manual.is_mapped());
        assert!(manual.is_manual());
        assert_eq!(manual.confidence, 1.0);
    }

    #[test]
    fn test_inactive_mapping_is_not_mapped() {
        let mut m = ProductMapping::manual(&scope(), item());
        m.active = false;
        assert!(!m.is_mapped());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let m = ProductMapping::suggested(&scope(), item(), 1.7);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn test_fallback_scope_drops_store() {
        let s = scope();
        assert!(s.fallback().store_id.is_none());
        assert_eq!(s.fallback().key(), "P-1:SKU-1");
    }
}
