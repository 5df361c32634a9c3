//! # Store Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error ──► DbError ──► SyncError::DatabaseError (stockbridge-sync)│
//! │                                 logged; the entity is retried next pass │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A lost compare-and-swap is *not* an error: it is reported as
//! [`CasOutcome::Conflict`](crate::repository::bindings::CasOutcome).

use thiserror::Error;

/// SQLite primary result codes for a contended database.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A UNIQUE index rejected the write, e.g. a native id that is already
    /// bound to another canonical entity.
    #[error("{field} already taken: '{value}'")]
    UniqueViolation { field: String, value: String },

    /// Usually a binding or audit row for an unregistered canonical id.
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Another connection holds the write lock past `busy_timeout`.
    #[error("Store busy: {0}")]
    Busy(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored value could not be decoded back into a domain type.
    #[error("Corrupt {column} value: {reason}")]
    Corrupt { column: String, reason: String },
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupt(column: impl Into<String>, reason: impl ToString) -> Self {
        DbError::Corrupt {
            column: column.into(),
            reason: reason.to_string(),
        }
    }

    /// Busy/locked stores and timed-out pools clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy(_) | DbError::ConnectionFailed(_))
    }
}

/// `"UNIQUE constraint failed: bindings.platform, bindings.native_id"`
/// → `"bindings.platform, bindings.native_id"`.
fn constraint_columns(message: &str) -> String {
    message
        .split_once(": ")
        .map(|(_, cols)| cols.to_string())
        .unwrap_or_else(|| message.to_string())
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                let code = db_err.code();

                if matches!(code.as_deref(), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                    DbError::Busy(msg.to_string())
                } else if msg.contains("UNIQUE constraint failed") {
                    DbError::UniqueViolation {
                        field: constraint_columns(msg),
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::ConnectionFailed("pool timed out".to_string()),
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),

            other => DbError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::corrupt("json", err)
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_columns() {
        assert_eq!(
            constraint_columns("UNIQUE constraint failed: bindings.platform, bindings.native_id"),
            "bindings.platform, bindings.native_id"
        );
        assert_eq!(constraint_columns("odd"), "odd");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Busy("database is locked".into()).is_transient());
        assert!(!DbError::not_found("binding", "x").is_transient());
    }
}
