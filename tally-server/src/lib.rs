//! tally-server - multi-marketplace order, shipment and settlement reconciliation
//!
//! # Module layout
//!
//! ```text
//! tally-server/src/
//! ├── adapters.rs    # marketplace / ERP adapter contracts and registry
//! ├── vault.rs       # encrypted credential storage
//! ├── db/            # repository traits, PostgreSQL and in-memory backends
//! ├── pipeline/      # sync, mapping, posting, gateway, shipment, settlement, retry
//! ├── engine.rs      # wiring of the pipelines
//! ├── workers.rs     # periodic scan loops
//! ├── tasks.rs       # background task registry
//! ├── api/           # HTTP routes
//! └── config.rs / logger.rs / crypto.rs
//! ```

pub mod adapters;
pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod logger;
pub mod pipeline;
pub mod tasks;
pub mod vault;
pub mod workers;

#[cfg(test)]
mod testkit;

pub use adapters::{AdapterError, AdapterRegistry, ErpAdapter, MarketplaceAdapter};
pub use config::Config;
pub use engine::Engine;
