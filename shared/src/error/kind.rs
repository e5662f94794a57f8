//! Handling-policy classification for error codes

use super::codes::ErrorCode;
use serde::{Deserialize, Serialize};

/// How a pipeline reacts to an error
///
/// Category answers "where did it happen", kind answers "what do we do about it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient external failure: back off and retry within the retry budget
    Retryable,
    /// Permanent external failure: mark FAILED, no retry, surface to an operator
    Fatal,
    /// Rejected before any external call; nothing was applied
    Precondition,
    /// Data did not reconcile; FAILED with the discrepancy attached
    Validation,
    /// Our own fault (storage, configuration, bugs)
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
            Self::Precondition => "precondition",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

impl ErrorCode {
    /// Get the handling kind for this error code
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkError
            | Self::TimeoutError
            | Self::RateLimited
            | Self::UpstreamUnavailable => ErrorKind::Retryable,

            Self::AuthenticationFailed
            | Self::Forbidden
            | Self::MalformedPayload
            | Self::AdapterNotRegistered
            | Self::CredentialNotFound
            | Self::CredentialDecryptFailed
            | Self::CredentialEncryptFailed
            | Self::RetryBudgetExhausted => ErrorKind::Fatal,

            Self::NotFound
            | Self::AlreadyExists
            | Self::InvalidStateTransition
            | Self::StoreNotFound
            | Self::StoreInactive
            | Self::SyncAlreadyRunning
            | Self::SyncJobNotFound
            | Self::SyncJobCancelled
            | Self::MappingRequired
            | Self::MappingNotFound
            | Self::MappingNotSuggested
            | Self::PostingNotFound
            | Self::PostingInFlight
            | Self::PostingNotReady
            | Self::OrderNotFound
            | Self::OrderEmpty
            | Self::ShipmentNotFound
            | Self::DuplicateTracking
            | Self::MarketPushAlreadyCompleted
            | Self::TrackingNumberRequired
            | Self::ShipmentCancelled
            | Self::SettlementBatchNotFound
            | Self::SettlementAlreadyCollected
            | Self::SettlementCancelled => ErrorKind::Precondition,

            Self::ValidationFailed
            | Self::InvalidRequest
            | Self::InvalidTimeRange
            | Self::SettlementMismatch => ErrorKind::Validation,

            Self::Success
            | Self::Unknown
            | Self::InternalError
            | Self::DatabaseError
            | Self::ConfigError => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_transients_are_retryable() {
        for code in [
            ErrorCode::NetworkError,
            ErrorCode::TimeoutError,
            ErrorCode::RateLimited,
            ErrorCode::UpstreamUnavailable,
        ] {
            assert!(code.kind().is_retryable(), "{code} should be retryable");
        }
    }

    #[test]
    fn test_auth_and_payload_failures_are_fatal() {
        assert_eq!(ErrorCode::AuthenticationFailed.kind(), ErrorKind::Fatal);
        assert_eq!(ErrorCode::Forbidden.kind(), ErrorKind::Fatal);
        assert_eq!(ErrorCode::MalformedPayload.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_guards_are_preconditions() {
        assert_eq!(ErrorCode::MappingRequired.kind(), ErrorKind::Precondition);
        assert_eq!(
            ErrorCode::InvalidStateTransition.kind(),
            ErrorKind::Precondition
        );
        assert_eq!(ErrorCode::DuplicateTracking.kind(), ErrorKind::Precondition);
        assert_eq!(
            ErrorCode::MarketPushAlreadyCompleted.kind(),
            ErrorKind::Precondition
        );
    }

    #[test]
    fn test_mismatch_is_validation() {
        assert_eq!(ErrorCode::SettlementMismatch.kind(), ErrorKind::Validation);
        assert_eq!(ErrorCode::DatabaseError.kind(), ErrorKind::Internal);
    }
}
