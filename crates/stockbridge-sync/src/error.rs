//! # Sync Error Types
//!
//! Error types for the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Domain              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Mapping                │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  Domain                 │ │
//! │  │  ConfigLoad     │  │  Http           │  │  DatabaseError          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ValidationError (separate enum) covers rejected webhook deliveries.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use stockbridge_core::{CoreError, MappingError};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering engine-level failures.
///
/// Per-operation platform failures are not errors here; the executor turns
/// them into [`ApplyOutcome`](crate::executor::ApplyOutcome) variants.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The platform answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The platform answered 2xx with a body we could not read.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Server error: {0}")]
    ServerFailed(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    #[error("Mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Why an inbound webhook was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Signature missing or HMAC mismatch; the delivery is discarded.
    #[error("Webhook signature mismatch")]
    BadSignature,

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<stockbridge_db::DbError> for SyncError {
    fn from(err: stockbridge_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Mapping(e) => SyncError::Mapping(e),
            other => SyncError::Domain(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if retrying the same call later may succeed.
    ///
    /// ## Retryable Errors
    /// - Connection failures and timeouts
    /// - HTTP 408, 429 and 5xx
    /// - Database errors (busy / locked store)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::InvalidResponse(_)
            | SyncError::DatabaseError(_) => true,
            SyncError::Http { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_) | SyncError::InvalidUrl(_) | SyncError::ConfigLoadFailed(_)
        )
    }
}

/// 408, 429 and every 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}
