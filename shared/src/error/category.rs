//! Error category classification

use super::codes::ErrorCode;
use serde::{Deserialize, Serialize};

/// Error category classification based on error code ranges
///
/// Categories are determined by the leading digit of the error code:
/// - 0xxx: General errors
/// - 1xxx: Credential errors
/// - 2xxx: Store / sync errors
/// - 3xxx: Mapping errors
/// - 4xxx: Posting errors
/// - 5xxx: Shipment errors
/// - 6xxx: Settlement errors
/// - 7xxx: External system errors
/// - 9xxx: System errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// General errors (0xxx)
    General,
    /// Credential errors (1xxx)
    Credential,
    /// Store / sync errors (2xxx)
    Sync,
    /// Mapping errors (3xxx)
    Mapping,
    /// Posting errors (4xxx)
    Posting,
    /// Shipment errors (5xxx)
    Shipment,
    /// Settlement errors (6xxx)
    Settlement,
    /// External system errors (7xxx)
    External,
    /// System errors (8xxx and up)
    System,
}

impl ErrorCategory {
    /// Determine category from error code value
    pub fn from_code(code: u16) -> Self {
        match code {
            0..1000 => Self::General,
            1000..2000 => Self::Credential,
            2000..3000 => Self::Sync,
            3000..4000 => Self::Mapping,
            4000..5000 => Self::Posting,
            5000..6000 => Self::Shipment,
            6000..7000 => Self::Settlement,
            7000..8000 => Self::External,
            _ => Self::System,
        }
    }

    /// Get the string name for this category
    pub fn name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Credential => "credential",
            Self::Sync => "sync",
            Self::Mapping => "mapping",
            Self::Posting => "posting",
            Self::Shipment => "shipment",
            Self::Settlement => "settlement",
            Self::External => "external",
            Self::System => "system",
        }
    }
}

impl ErrorCode {
    /// Get the category for this error code
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_code() {
        assert_eq!(ErrorCategory::from_code(0), ErrorCategory::General);
        assert_eq!(ErrorCategory::from_code(999), ErrorCategory::General);
        assert_eq!(ErrorCategory::from_code(1001), ErrorCategory::Credential);
        assert_eq!(ErrorCategory::from_code(2003), ErrorCategory::Sync);
        assert_eq!(ErrorCategory::from_code(3001), ErrorCategory::Mapping);
        assert_eq!(ErrorCategory::from_code(4002), ErrorCategory::Posting);
        assert_eq!(ErrorCategory::from_code(5002), ErrorCategory::Shipment);
        assert_eq!(ErrorCategory::from_code(6003), ErrorCategory::Settlement);
        assert_eq!(ErrorCategory::from_code(7004), ErrorCategory::External);
        assert_eq!(ErrorCategory::from_code(8500), ErrorCategory::System);
        assert_eq!(ErrorCategory::from_code(9001), ErrorCategory::System);
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::Success.category(), ErrorCategory::General);
        assert_eq!(
            ErrorCode::CredentialNotFound.category(),
            ErrorCategory::Credential
        );
        assert_eq!(ErrorCode::StoreInactive.category(), ErrorCategory::Sync);
        assert_eq!(ErrorCode::MappingRequired.category(), ErrorCategory::Mapping);
        assert_eq!(ErrorCode::PostingInFlight.category(), ErrorCategory::Posting);
        assert_eq!(
            ErrorCode::DuplicateTracking.category(),
            ErrorCategory::Shipment
        );
        assert_eq!(
            ErrorCode::SettlementMismatch.category(),
            ErrorCategory::Settlement
        );
        assert_eq!(ErrorCode::RateLimited.category(), ErrorCategory::External);
        assert_eq!(ErrorCode::InternalError.category(), ErrorCategory::System);
    }

    #[test]
    fn test_category_serde() {
        let json = serde_json::to_string(&ErrorCategory::Settlement).unwrap();
        assert_eq!(json, "\"settlement\"");

        let category: ErrorCategory = serde_json::from_str("\"external\"").unwrap();
        assert_eq!(category, ErrorCategory::External);
    }
}
