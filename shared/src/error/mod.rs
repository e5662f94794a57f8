//! Unified error system for the reconciliation engine
//!
//! - [`ErrorCode`]: Standardized error codes for all error types
//! - [`ErrorCategory`]: Classification of errors by domain
//! - [`ErrorKind`]: Handling policy (retry, fail, reject)
//! - [`AppError`]: Rich error type with codes, messages, and details
//!
//! # Example
//!
//! ```
//! use shared::error::{AppError, ErrorCode, ErrorKind};
//!
//! let err = AppError::new(ErrorCode::RateLimited);
//! assert_eq!(err.kind(), ErrorKind::Retryable);
//!
//! let err = AppError::mapping_required(vec!["P-1:SKU-1".into()]);
//! assert_eq!(err.unmapped_keys().len(), 1);
//! ```

mod category;
mod codes;
mod kind;
mod types;

pub use category::ErrorCategory;
pub use codes::{ErrorCode, InvalidErrorCode};
pub use kind::ErrorKind;
pub use types::{AppError, AppResult};
