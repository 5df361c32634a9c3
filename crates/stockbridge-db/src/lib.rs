//! # stockbridge-db: Reconciliation Store
//!
//! SQLite persistence for the bridge.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         stockbridge-db                                  │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │                     Database (pool.rs)                            │ │
//! │  │   SqlitePool + per-entity KeyedLocks                              │ │
//! │  └─────────────────────────────┬─────────────────────────────────────┘ │
//! │                                │                                        │
//! │     ┌──────────┬──────────┬────┴─────┬──────────┬─────────┬────────┐   │
//! │     ▼          ▼          ▼          ▼          ▼         ▼        ▼   │
//! │  entities  bindings  operations  dead_letters  audit    inbox  cursors │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let db = Database::new(DbConfig::new("bridge.db")).await?;
//! let id = db.entities().register(EntityKind::Variant, Some("MUG-01")).await?;
//! let outcome = db.bindings().compare_and_swap(id, Platform::Storefront, None, &update).await?;
//! ```

pub mod error;
pub mod locks;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use locks::{KeyedGuard, KeyedLocks};
pub use pool::{Database, DbConfig};
pub use repository::audit::{AuditRecord, AuditRepository};
pub use repository::bindings::{BindingRepository, BindingUpdate, CasOutcome};
pub use repository::cursors::CursorRepository;
pub use repository::dead_letters::DeadLetterRepository;
pub use repository::entities::{EntityRecord, EntityRepository};
pub use repository::inbox::{InboxEntry, InboxPush, InboxRepository};
pub use repository::operations::{OperationRepository, OperationState, QueuedOperation};
