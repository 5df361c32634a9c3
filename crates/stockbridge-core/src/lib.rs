//! # stockbridge-core: Pure Domain Logic
//!
//! Canonical model, mapping tables and conflict resolution for the
//! storefront ↔ warehouse bridge. Nothing in this crate performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stockbridge Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          stockbridge-sync (adapters, executor, scheduler)       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ stockbridge-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  mapping  │  │ conflict  │  │   money   │  │   │
//! │  │   │ Canonical │  │  Mapper   │  │ resolve() │  │   Money   │  │   │
//! │  │   │ Binding   │  │  tables   │  │ Policy    │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              stockbridge-db (Reconciliation Store)              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical entities, bindings, operations, revisions
//! - [`mapping`] - Native ↔ canonical mapping tables
//! - [`conflict`] - Three-way merge and precedence rules
//! - [`money`] - Integer minor-unit money
//! - [`validation`] - SKU / currency normalisation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use stockbridge_core::{EntityKind, Mapper, NativePayload, Platform};
//!
//! let mapper = Mapper::new();
//! let body = json!({"sku": "mug-01", "available": 8}).as_object().cloned().unwrap();
//! let entity = mapper
//!     .to_canonical(Platform::Storefront, &NativePayload::new(EntityKind::InventoryLevel, body))
//!     .unwrap();
//!
//! let warehouse = mapper.to_native(Platform::Warehouse, &entity).unwrap();
//! assert_eq!(warehouse.body()["article"], "MUG-01");
//! assert_eq!(warehouse.body()["stock"], 8);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod mapping;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{
    resolve, Acknowledgement, ConflictPolicy, Observation, Resolution, ResolutionInput, SideState,
};
pub use error::{CoreError, CoreResult, MappingError, MappingResult, ValidationError};
pub use mapping::{FieldOverride, Mapper};
pub use money::Money;
pub use types::*;
