//! Marketplace product -> ERP item resolution

use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{ErpItemRef, MappingScope, MappingStatus, MappingType, OrderItem, ProductMapping};
use shared::util::now_millis;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::adapters::ErpItem;
use crate::audit_log;
use crate::db::Repositories;

pub struct ProductMappingResolver {
    repos: Repositories,
    min_confidence: f64,
}

impl ProductMappingResolver {
    pub fn new(repos: Repositories, min_confidence: f64) -> Self {
        Self {
            repos,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    /// Store-scoped before tenant-wide. A MAPPED mapping in either slot wins
    /// over a suggestion; otherwise the highest-priority active record is
    /// returned so callers can surface it.
    pub async fn resolve(&self, scope: &MappingScope) -> AppResult<Option<ProductMapping>> {
        let mut candidates = Vec::with_capacity(2);
        if scope.store_id.is_some() {
            candidates.extend(self.repos.mappings.find_active_mapping(scope).await?);
        }
        candidates.extend(self.repos.mappings.find_active_mapping(&scope.fallback()).await?);

        if let Some(pos) = candidates.iter().position(ProductMapping::is_mapped) {
            return Ok(Some(candidates.swap_remove(pos)));
        }
        Ok(candidates.into_iter().next())
    }

    /// ERP item per `productId:sku` key; fails with the unmapped keys listed
    pub async fn require_mapped(
        &self,
        tenant_id: &str,
        store_id: Option<Uuid>,
        marketplace: &str,
        items: &[OrderItem],
    ) -> AppResult<HashMap<String, ErpItemRef>> {
        let mut resolved = HashMap::new();
        let mut unmapped: Vec<String> = Vec::new();

        for item in items {
            let key = item.mapping_key();
            if resolved.contains_key(&key) || unmapped.contains(&key) {
                continue;
            }
            let scope = item_scope(tenant_id, store_id, marketplace, item);
            match self.resolve(&scope).await? {
                Some(mapping) if mapping.is_mapped() => {
                    if let Some(erp_item) = mapping.erp_item() {
                        resolved.insert(key, erp_item);
                    }
                }
                _ => unmapped.push(key),
            }
        }

        if !unmapped.is_empty() {
            return Err(AppError::mapping_required(unmapped));
        }
        Ok(resolved)
    }

    /// Operator mapping; replaces whatever is active in the same scope
    pub async fn set_manual_mapping(
        &self,
        scope: &MappingScope,
        item: ErpItemRef,
    ) -> AppResult<ProductMapping> {
        if item.item_code.trim().is_empty() {
            return Err(AppError::validation("ERP item code must not be empty"));
        }
        let mapping = ProductMapping::manual(scope, item);
        self.repos.mappings.replace_active_mapping(&mapping).await?;

        audit_log!(
            scope.tenant_id.as_str(),
            "mapping_set_manual",
            scope.key().as_str(),
            mapping.erp_item_code.as_deref().unwrap_or_default()
        );
        Ok(mapping)
    }

    /// SUGGESTED -> MAPPED, taking ownership as a manual mapping
    pub async fn confirm_suggestion(
        &self,
        tenant_id: &str,
        mapping_id: Uuid,
    ) -> AppResult<ProductMapping> {
        let mut mapping = self
            .repos
            .mappings
            .find_mapping(tenant_id, mapping_id)
            .await?
            .filter(|m| m.active)
            .ok_or_else(|| {
                AppError::with_message(
                    ErrorCode::MappingNotFound,
                    format!("mapping {mapping_id} not found"),
                )
            })?;
        if mapping.status != MappingStatus::Suggested || mapping.erp_item_code.is_none() {
            return Err(AppError::with_message(
                ErrorCode::MappingNotSuggested,
                format!("mapping {mapping_id} is {}, not SUGGESTED", mapping.status),
            ));
        }

        mapping.status = MappingStatus::Mapped;
        mapping.mapping_type = MappingType::Manual;
        mapping.updated_at = now_millis();
        self.repos.mappings.update_mapping(&mapping).await?;

        audit_log!(tenant_id, "mapping_confirm", mapping.key().as_str());
        Ok(mapping)
    }

    /// Record an automatic suggestion for `scope` from `candidates`
    ///
    /// Returns the active mapping afterwards. A MAPPED or MANUAL mapping in the
    /// scope is returned untouched; `None` when nothing scores high enough.
    pub async fn suggest(
        &self,
        scope: &MappingScope,
        product_name: &str,
        candidates: &[ErpItem],
    ) -> AppResult<Option<ProductMapping>> {
        let existing = self.repos.mappings.find_active_mapping(scope).await?;
        if let Some(current) = &existing
            && (current.status == MappingStatus::Mapped || current.is_manual())
        {
            return Ok(existing);
        }

        let Some((best, confidence)) = best_match(&scope.sku, product_name, candidates) else {
            return Ok(existing);
        };
        if confidence < self.min_confidence {
            tracing::debug!(
                tenant_id = %scope.tenant_id,
                key = %scope.key(),
                confidence,
                "No suggestion above threshold"
            );
            return Ok(existing);
        }
        if let Some(current) = &existing
            && current.erp_item_code.as_deref() == Some(best.item_code.as_str())
            && current.confidence == confidence
        {
            return Ok(existing);
        }

        let mapping = ProductMapping::suggested(
            scope,
            ErpItemRef {
                item_code: best.item_code.clone(),
                item_name: Some(best.item_name.clone()),
                warehouse_code: best.warehouse_code.clone(),
            },
            confidence,
        );
        self.repos.mappings.replace_active_mapping(&mapping).await?;
        tracing::info!(
            tenant_id = %scope.tenant_id,
            key = %scope.key(),
            item_code = %best.item_code,
            confidence,
            "Mapping suggested"
        );
        Ok(Some(mapping))
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        status: Option<MappingStatus>,
    ) -> AppResult<Vec<ProductMapping>> {
        Ok(self.repos.mappings.list_mappings(tenant_id, status).await?)
    }
}

pub fn item_scope(
    tenant_id: &str,
    store_id: Option<Uuid>,
    marketplace: &str,
    item: &OrderItem,
) -> MappingScope {
    MappingScope {
        tenant_id: tenant_id.to_string(),
        store_id,
        marketplace: marketplace.to_string(),
        product_id: item.product_id.clone(),
        sku: item.sku.clone(),
    }
}

/// Highest-scoring candidate; equal scores go to the smallest item code
fn best_match<'a>(sku: &str, name: &str, candidates: &'a [ErpItem]) -> Option<(&'a ErpItem, f64)> {
    candidates
        .iter()
        .map(|c| (c, score(sku, name, c)))
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.item_code.cmp(&a.item_code))
        })
}

fn score(sku: &str, name: &str, candidate: &ErpItem) -> f64 {
    let sku = sku.trim();
    if !sku.is_empty()
        && (candidate.sku.as_deref().map(str::trim) == Some(sku) || candidate.item_code.trim() == sku)
    {
        return 1.0;
    }
    dice_similarity(name, &candidate.item_name)
}

fn normalize(s: &str) -> Vec<char> {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Sørensen–Dice coefficient over character bigrams of the normalised strings
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.len() < 2 || b.len() < 2 {
        return if a == b { 1.0 } else { 0.0 };
    }

    let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
    for w in a.windows(2) {
        *bigrams.entry((w[0], w[1])).or_default() += 1;
    }
    let mut overlap = 0usize;
    for w in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(w[0], w[1]))
            && *count > 0
        {
            *count -= 1;
            overlap += 1;
        }
    }
    (2 * overlap) as f64 / ((a.len() - 1) + (b.len() - 1)) as f64
}
