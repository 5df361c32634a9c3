//! # Error Types
//!
//! Domain-specific error types for stockbridge-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stockbridge-core errors (this file)                                   │
//! │  ├── CoreError        - Identity / parsing failures                    │
//! │  ├── MappingError     - Native payload cannot be represented           │
//! │  └── ValidationError  - Field value rules                              │
//! │                                                                         │
//! │  stockbridge-db errors (separate crate)                                │
//! │  └── DbError          - Store failures                                 │
//! │                                                                         │
//! │  stockbridge-sync errors (separate crate)                              │
//! │  └── SyncError        - Network, config, channel failures              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `MappingError` excludes one entity from sync; it never stops a run.

use thiserror::Error;

use crate::types::{EntityKind, Platform};

// =============================================================================
// Core Error
// =============================================================================

/// General domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An entity already bound to one canonical id was asked to take another.
    #[error("Entity already bound to {existing}, refusing {requested}")]
    IdentityAlreadyAssigned { existing: String, requested: String },

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),
}

// =============================================================================
// Mapping Error
// =============================================================================

/// A native payload (or canonical entity) that cannot be translated losslessly.
///
/// ## When This Occurs
/// ```text
/// to_canonical:  {"title": "Mug", "colour": "red"}   → UnknownField(colour)
///                {"price": 19.99}                    → TypeMismatch(price)
///                {"title": "Mug"}                    → MissingRequiredField(handle)
///
/// to_native:     canonical field with no native column → UnknownField
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{platform} {kind} has no mapping for field '{field}'")]
    UnknownField {
        platform: Platform,
        kind: EntityKind,
        field: String,
    },

    #[error("Field '{field}' expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },

    #[error("Required field '{field}' is missing")]
    MissingRequiredField { field: String },

    /// The value has the right shape but breaks a field rule (e.g. blank SKU).
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl MappingError {
    /// Name of the offending field.
    pub fn field(&self) -> &str {
        match self {
            MappingError::UnknownField { field, .. }
            | MappingError::TypeMismatch { field, .. }
            | MappingError::MissingRequiredField { field }
            | MappingError::InvalidValue { field, .. } => field,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field value rule violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., malformed decimal, bad currency code).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Convenience type alias for mapper results.
pub type MappingResult<T> = Result<T, MappingError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MappingError::UnknownField {
            platform: Platform::Storefront,
            kind: EntityKind::Product,
            field: "colour".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "storefront product has no mapping for field 'colour'"
        );
        assert_eq!(err.field(), "colour");

        let err = ValidationError::Required {
            field: "sku".to_string(),
        };
        assert_eq!(err.to_string(), "sku is required");
    }

    #[test]
    fn test_mapping_converts_to_core_error() {
        let err: CoreError = MappingError::MissingRequiredField {
            field: "handle".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Mapping(_)));
    }
}
