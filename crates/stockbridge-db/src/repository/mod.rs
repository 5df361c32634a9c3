//! # Repository Module
//!
//! Store repositories, one per table family.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Engine / Scheduler / Webhook handler                                   │
//! │       │                                                                 │
//! │       │  db.bindings().compare_and_swap(id, platform, expected, new)    │
//! │       ▼                                                                 │
//! │  BindingRepository ──► SQL ──► SQLite                                   │
//! │                                                                         │
//! │  Every SQL statement in the workspace lives under this module.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`entities::EntityRepository`] - canonical ids, natural keys, baselines
//! - [`bindings::BindingRepository`] - lookup and compare-and-swap
//! - [`operations::OperationRepository`] - operation outbox
//! - [`dead_letters::DeadLetterRepository`] - operator queue
//! - [`audit::AuditRepository`] - conflict audit notes
//! - [`inbox::InboxRepository`] - durable webhook queue
//! - [`cursors::CursorRepository`] - polling resume points

pub mod audit;
pub mod bindings;
pub mod cursors;
pub mod dead_letters;
pub mod entities;
pub mod inbox;
pub mod operations;

use std::str::FromStr;

use stockbridge_core::{CanonicalId, EntityKind, Platform};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

pub(crate) fn parse_platform(value: &str) -> DbResult<Platform> {
    Platform::from_str(value).map_err(|e| DbError::corrupt("platform", e))
}

pub(crate) fn parse_kind(value: &str) -> DbResult<EntityKind> {
    EntityKind::from_str(value).map_err(|e| DbError::corrupt("kind", e))
}

pub(crate) fn parse_canonical_id(value: &str) -> DbResult<CanonicalId> {
    CanonicalId::from_str(value).map_err(|e| DbError::corrupt("canonical_id", e))
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> DbResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| DbError::corrupt(column, e))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use stockbridge_core::{CanonicalEntity, EntityKind, FieldValue, Fields};

    use crate::{Database, DbConfig};

    pub async fn database() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    pub fn inventory(sku: &str, qty: i64) -> CanonicalEntity {
        let mut fields = Fields::new();
        fields.insert("sku".into(), FieldValue::Text(sku.into()));
        fields.insert("quantity".into(), FieldValue::Integer(qty));
        CanonicalEntity::new(EntityKind::InventoryLevel, fields)
    }
}
