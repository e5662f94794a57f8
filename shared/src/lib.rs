//! Shared types for the tally reconciliation engine
//!
//! Domain records, lifecycle transition tables, and the unified error model
//! used by the server crate and its adapters.

pub mod error;
pub mod models;
pub mod util;

pub use error::{AppError, AppResult, ErrorCategory, ErrorCode, ErrorKind};
pub use serde::{Deserialize, Serialize};
