//! # Validation Module
//!
//! Field normalisation and validation applied by the mapper.
//!
//! Both platforms accept loosely formatted identifiers (`" mug-01 "` on one
//! side, `"MUG-01"` on the other). Normalising before hashing keeps the two
//! from looking like a perpetual conflict.
//!
//! ## Usage
//! ```rust
//! use stockbridge_core::validation::{normalize_sku, validate_sku};
//!
//! let sku = normalize_sku("  mug-01 ");
//! assert_eq!(sku, "MUG-01");
//! validate_sku(&sku).unwrap();
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest SKU either platform stores.
pub const MAX_SKU_LENGTH: usize = 64;

// =============================================================================
// SKU
// =============================================================================

/// Trims and upper-cases a SKU.
pub fn normalize_sku(sku: &str) -> String {
    sku.trim().to_uppercase()
}

/// Validates a normalised SKU.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - No whitespace or control characters
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    if sku.is_empty() {
        return Err(ValidationError::Required {
            field: "sku".to_string(),
        });
    }

    if sku.chars().count() > MAX_SKU_LENGTH {
        return Err(ValidationError::TooLong {
            field: "sku".to_string(),
            max: MAX_SKU_LENGTH,
        });
    }

    if sku.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Currency
// =============================================================================

/// Upper-cases an ISO 4217 currency code.
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Validates a normalised currency code (three ASCII letters).
pub fn validate_currency(code: &str) -> ValidationResult<()> {
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: format!("{code:?} is not a three-letter code"),
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sku() {
        assert_eq!(normalize_sku(" coke-330\n"), "COKE-330");
        assert_eq!(normalize_sku("ABC"), "ABC");
    }

    #[test]
    fn test_validate_sku() {
        assert!(validate_sku("COKE-330").is_ok());
        assert!(validate_sku("A/B.1").is_ok());
        assert!(matches!(
            validate_sku(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_sku(&"A".repeat(65)),
            Err(ValidationError::TooLong { max: 64, .. })
        ));
        assert!(matches!(
            validate_sku("COKE 330"),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_currency() {
        assert_eq!(normalize_currency(" rub"), "RUB");
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("US").is_err());
        assert!(validate_currency("usd").is_err());
    }
}
