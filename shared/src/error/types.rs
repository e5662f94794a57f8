//! Application error type

use super::codes::ErrorCode;
use super::kind::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Result error of every pipeline operation
///
/// `code` decides handling through [`ErrorKind`]; `details` carries
/// machine-readable context such as unmapped keys or settlement discrepancies.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Value>>,
}

impl AppError {
    /// Error carrying the code's default message
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.message().to_string(),
            code,
            details: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.as_ref().and_then(|d| d.get(key))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::ValidationFailed, msg)
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::DatabaseError, msg)
    }

    /// Create a mapping-required error listing the unmapped `productId:sku` keys
    pub fn mapping_required(unmapped: Vec<String>) -> Self {
        Self::with_message(
            ErrorCode::MappingRequired,
            format!("Product mapping required for: {}", unmapped.join(", ")),
        )
        .with_detail("unmapped", unmapped)
    }

    /// Unmapped keys carried by a mapping-required error
    pub fn unmapped_keys(&self) -> Vec<String> {
        match self.detail("unmapped") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_message_comes_from_code() {
        let err = AppError::new(ErrorCode::DuplicateTracking);
        assert_eq!(err.message, ErrorCode::DuplicateTracking.message());
        assert!(err.detail("unmapped").is_none());
    }

    #[test]
    fn test_app_error_with_detail() {
        let err = AppError::validation("Totals differ")
            .with_detail("field", "gross_sales")
            .with_detail("difference", "120");

        assert_eq!(err.code, ErrorCode::ValidationFailed);
        let details = err.details.unwrap();
        assert_eq!(details.get("field").unwrap(), "gross_sales");
        assert_eq!(details.get("difference").unwrap(), "120");
    }

    #[test]
    fn test_app_error_kind() {
        assert!(AppError::new(ErrorCode::TimeoutError).is_retryable());
        assert!(!AppError::new(ErrorCode::AuthenticationFailed).is_retryable());
        assert_eq!(
            AppError::new(ErrorCode::SettlementMismatch).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_mapping_required_lists_keys() {
        let err = AppError::mapping_required(vec!["P-2:SKU-B".to_string()]);
        assert_eq!(err.code, ErrorCode::MappingRequired);
        assert_eq!(err.unmapped_keys(), vec!["P-2:SKU-B".to_string()]);
        assert!(err.message.contains("P-2:SKU-B"));
    }

    #[test]
    fn test_database_error_is_internal() {
        let err = AppError::database("connection reset");
        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_display_is_message() {
        let err = AppError::with_message(ErrorCode::OrderNotFound, "order MO-42 not found");
        assert_eq!(err.to_string(), "order MO-42 not found");
    }
}
