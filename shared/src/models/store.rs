//! Marketplace store registry

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::now_millis;

/// A tenant's storefront on one marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    /// Marketplace code, matches a registered adapter (e.g. "COUPANG")
    pub marketplace: String,
    pub active: bool,
    /// End of the last completed sync range (epoch millis)
    pub last_synced_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        marketplace: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            marketplace: marketplace.into(),
            active: true,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
