//! # stockbridge-sync: Sync Engine for Stockbridge
//!
//! Everything that talks to the network: platform clients, change sources,
//! the reconciliation engine, the executor, the retry scheduler and the
//! webhook/operator server.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bridge Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  BridgeAgent (Main Orchestrator)                 │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ WebhookServer  │  │  SyncEngine    │  │  Scheduler             │    │
//! │  │                │  │                │  │                        │    │
//! │  │ HMAC check     │  │ poll cursors   │  │ claims due ops         │    │
//! │  │ durable inbox  │  │ map + resolve  │  │ Executor per platform  │    │
//! │  │ dead letters   │  │ CAS acks       │  │ backoff + dead letters │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  StorefrontApi / WarehouseApi (reqwest) behind PlatformApi      │   │
//! │  │  StorefrontSource / WarehouseSource behind ChangeSource         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `BridgeAgent` orchestrator and its handle
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//! - [`api`] - `PlatformApi` trait and the shared HTTP client
//! - [`source`] - `ChangeSource` trait and paged change feeds
//! - [`storefront`] / [`warehouse`] - Platform adapters
//! - [`signature`] - Webhook HMAC helpers
//! - [`engine`] - Reconciliation passes
//! - [`executor`] - Applies one operation to one platform
//! - [`rate_limit`] - Token bucket
//! - [`scheduler`] - Retry/backoff and dead-lettering
//! - [`webhook`] - Inbound HTTP routes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockbridge_db::{Database, DbConfig};
//! use stockbridge_sync::{BridgeAgent, BridgeConfig};
//!
//! let config = BridgeConfig::load(None)?;
//! let db = Database::new(DbConfig::new(&config.database.path)).await?;
//!
//! let handle = BridgeAgent::from_config(config, db)?.start().await?;
//! // ...
//! handle.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod scheduler;
pub mod signature;
pub mod source;
pub mod storefront;
pub mod warehouse;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{BridgeAgent, BridgeHandle, SyncStatus};
pub use api::{ApiError, HttpClient, NativeRecord, PlatformApi, RecordPage};
pub use config::{BridgeConfig, PlatformSettings, RetrySettings, WebhookSettings};
pub use engine::{RunReport, SyncEngine};
pub use error::{SyncError, SyncResult, ValidationError};
pub use executor::{Applied, ApplyOutcome, ConfirmOutcome, Executor};
pub use rate_limit::TokenBucket;
pub use scheduler::{DeliveryReport, RetryPolicy, Scheduler};
pub use source::{ChangeFeed, ChangePage, ChangeSource, RawWebhook};
pub use storefront::{StorefrontApi, StorefrontSource};
pub use warehouse::{WarehouseApi, WarehouseSource};
pub use webhook::{WebhookHandle, WebhookServer, WebhookState};
