//! Unified error codes for the reconciliation engine
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Credential / authentication errors
//! - 2xxx: Store and order-sync errors
//! - 3xxx: Product mapping errors
//! - 4xxx: Posting errors
//! - 5xxx: Shipment errors
//! - 6xxx: Settlement errors
//! - 7xxx: External system (marketplace / ERP) errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values so they can be persisted
/// next to a failed entity and compared across services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Resource already exists
    AlreadyExists = 4,
    /// Invalid request
    InvalidRequest = 5,
    /// State machine rejected the transition
    InvalidStateTransition = 6,
    /// Time range is empty or inverted
    InvalidTimeRange = 7,

    // ==================== 1xxx: Credential ====================
    /// No credential stored for the requested key
    CredentialNotFound = 1001,
    /// Stored credential could not be decrypted
    CredentialDecryptFailed = 1002,
    /// Credential could not be encrypted
    CredentialEncryptFailed = 1003,
    /// External system rejected the credentials
    AuthenticationFailed = 1004,
    /// External system refused the operation
    Forbidden = 1005,

    // ==================== 2xxx: Store / Sync ====================
    /// Store not found
    StoreNotFound = 2001,
    /// Store is deactivated
    StoreInactive = 2002,
    /// A non-terminal sync job already exists for the store
    SyncAlreadyRunning = 2003,
    /// Sync job not found
    SyncJobNotFound = 2004,
    /// Sync job was cancelled
    SyncJobCancelled = 2005,

    // ==================== 3xxx: Mapping ====================
    /// One or more order lines lack a MAPPED product mapping
    MappingRequired = 3001,
    /// Mapping not found
    MappingNotFound = 3002,
    /// Mapping is not a suggestion and cannot be confirmed
    MappingNotSuggested = 3003,

    // ==================== 4xxx: Posting ====================
    /// Posting not found
    PostingNotFound = 4001,
    /// Another submission for the same idempotency key is in flight
    PostingInFlight = 4002,
    /// Posting is not in a submittable state
    PostingNotReady = 4003,
    /// Order not found
    OrderNotFound = 4004,
    /// Order has no lines to post
    OrderEmpty = 4005,

    // ==================== 5xxx: Shipment ====================
    /// Shipment not found
    ShipmentNotFound = 5001,
    /// Tracking number already pushed to the marketplace
    DuplicateTracking = 5002,
    /// Market push already completed
    MarketPushAlreadyCompleted = 5003,
    /// Tracking number is required
    TrackingNumberRequired = 5004,
    /// Shipment has been cancelled
    ShipmentCancelled = 5005,

    // ==================== 6xxx: Settlement ====================
    /// Settlement batch not found
    SettlementBatchNotFound = 6001,
    /// Settlement batch already collected for the period
    SettlementAlreadyCollected = 6002,
    /// Settlement totals outside tolerance
    SettlementMismatch = 6003,
    /// Settlement batch has been cancelled
    SettlementCancelled = 6004,

    // ==================== 7xxx: External ====================
    /// No adapter registered for the marketplace / ERP
    AdapterNotRegistered = 7001,
    /// Network error talking to an external system
    NetworkError = 7002,
    /// External call timed out
    TimeoutError = 7003,
    /// External rate limit exceeded
    RateLimited = 7004,
    /// External system returned a 5xx
    UpstreamUnavailable = 7005,
    /// Payload rejected as malformed
    MalformedPayload = 7006,
    /// Automatic retries exhausted, manual action required
    RetryBudgetExhausted = 7007,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Configuration error
    ConfigError = 9003,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::AlreadyExists => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::InvalidStateTransition => "Invalid state transition",
            ErrorCode::InvalidTimeRange => "Time range start must be before its end",

            // Credential
            ErrorCode::CredentialNotFound => "Credential not found",
            ErrorCode::CredentialDecryptFailed => "Credential could not be decrypted",
            ErrorCode::CredentialEncryptFailed => "Credential could not be encrypted",
            ErrorCode::AuthenticationFailed => "External system rejected the credentials",
            ErrorCode::Forbidden => "External system refused the operation",

            // Store / Sync
            ErrorCode::StoreNotFound => "Store not found",
            ErrorCode::StoreInactive => "Store is inactive",
            ErrorCode::SyncAlreadyRunning => "A sync job is already active for this store",
            ErrorCode::SyncJobNotFound => "Sync job not found",
            ErrorCode::SyncJobCancelled => "Sync job has been cancelled",

            // Mapping
            ErrorCode::MappingRequired => "Product mapping required",
            ErrorCode::MappingNotFound => "Product mapping not found",
            ErrorCode::MappingNotSuggested => "Product mapping is not a suggestion",

            // Posting
            ErrorCode::PostingNotFound => "Posting not found",
            ErrorCode::PostingInFlight => "Posting submission already in flight",
            ErrorCode::PostingNotReady => "Posting is not ready to be submitted",
            ErrorCode::OrderNotFound => "Order not found",
            ErrorCode::OrderEmpty => "Order has no lines",

            // Shipment
            ErrorCode::ShipmentNotFound => "Shipment not found",
            ErrorCode::DuplicateTracking => "Tracking number already pushed to marketplace",
            ErrorCode::MarketPushAlreadyCompleted => "Market push already completed",
            ErrorCode::TrackingNumberRequired => "Tracking number is required",
            ErrorCode::ShipmentCancelled => "Shipment has been cancelled",

            // Settlement
            ErrorCode::SettlementBatchNotFound => "Settlement batch not found",
            ErrorCode::SettlementAlreadyCollected => "Settlement batch already collected",
            ErrorCode::SettlementMismatch => "Settlement totals outside tolerance",
            ErrorCode::SettlementCancelled => "Settlement batch has been cancelled",

            // External
            ErrorCode::AdapterNotRegistered => "No adapter registered",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::UpstreamUnavailable => "External system unavailable",
            ErrorCode::MalformedPayload => "Payload rejected as malformed",
            ErrorCode::RetryBudgetExhausted => "Retry budget exhausted",

            // System
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::ConfigError => "Configuration error",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            // General
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::Unknown),
            2 => Ok(ErrorCode::ValidationFailed),
            3 => Ok(ErrorCode::NotFound),
            4 => Ok(ErrorCode::AlreadyExists),
            5 => Ok(ErrorCode::InvalidRequest),
            6 => Ok(ErrorCode::InvalidStateTransition),
            7 => Ok(ErrorCode::InvalidTimeRange),

            // Credential
            1001 => Ok(ErrorCode::CredentialNotFound),
            1002 => Ok(ErrorCode::CredentialDecryptFailed),
            1003 => Ok(ErrorCode::CredentialEncryptFailed),
            1004 => Ok(ErrorCode::AuthenticationFailed),
            1005 => Ok(ErrorCode::Forbidden),

            // Store / Sync
            2001 => Ok(ErrorCode::StoreNotFound),
            2002 => Ok(ErrorCode::StoreInactive),
            2003 => Ok(ErrorCode::SyncAlreadyRunning),
            2004 => Ok(ErrorCode::SyncJobNotFound),
            2005 => Ok(ErrorCode::SyncJobCancelled),

            // Mapping
            3001 => Ok(ErrorCode::MappingRequired),
            3002 => Ok(ErrorCode::MappingNotFound),
            3003 => Ok(ErrorCode::MappingNotSuggested),

            // Posting
            4001 => Ok(ErrorCode::PostingNotFound),
            4002 => Ok(ErrorCode::PostingInFlight),
            4003 => Ok(ErrorCode::PostingNotReady),
            4004 => Ok(ErrorCode::OrderNotFound),
            4005 => Ok(ErrorCode::OrderEmpty),

            // Shipment
            5001 => Ok(ErrorCode::ShipmentNotFound),
            5002 => Ok(ErrorCode::DuplicateTracking),
            5003 => Ok(ErrorCode::MarketPushAlreadyCompleted),
            5004 => Ok(ErrorCode::TrackingNumberRequired),
            5005 => Ok(ErrorCode::ShipmentCancelled),

            // Settlement
            6001 => Ok(ErrorCode::SettlementBatchNotFound),
            6002 => Ok(ErrorCode::SettlementAlreadyCollected),
            6003 => Ok(ErrorCode::SettlementMismatch),
            6004 => Ok(ErrorCode::SettlementCancelled),

            // External
            7001 => Ok(ErrorCode::AdapterNotRegistered),
            7002 => Ok(ErrorCode::NetworkError),
            7003 => Ok(ErrorCode::TimeoutError),
            7004 => Ok(ErrorCode::RateLimited),
            7005 => Ok(ErrorCode::UpstreamUnavailable),
            7006 => Ok(ErrorCode::MalformedPayload),
            7007 => Ok(ErrorCode::RetryBudgetExhausted),

            // System
            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::DatabaseError),
            9003 => Ok(ErrorCode::ConfigError),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:04}", self.code())
    }
}
