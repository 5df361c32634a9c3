//! # Store Handle
//!
//! Opens the SQLite file behind the reconciliation store and hands out
//! repositories.
//!
//! ## Who Shares the Pool
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   webhook handlers ──► inbox().push            (short write)           │
//! │   engine task      ──► bindings / entities / audit / operations        │
//! │   scheduler lanes  ──► operations().claim_due, bindings().cas          │
//! │   operator routes  ──► dead_letters()                                  │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                    SqlitePool (WAL, busy_timeout)                      │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                      bridge.db  /  :memory:                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! File stores run in WAL mode so webhook inserts never wait on the
//! scheduler's reads. The in-memory store used by tests lives on exactly one
//! connection that is never recycled.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use stockbridge_core::CanonicalId;

use crate::error::{DbError, DbResult};
use crate::locks::KeyedLocks;
use crate::migrations;
use crate::repository::audit::AuditRepository;
use crate::repository::bindings::BindingRepository;
use crate::repository::cursors::CursorRepository;
use crate::repository::dead_letters::DeadLetterRepository;
use crate::repository::entities::EntityRepository;
use crate::repository::inbox::InboxRepository;
use crate::repository::operations::OperationRepository;

const MEMORY_URL: &str = "sqlite::memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where the store lives and how hard it may be hit.
///
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("/var/lib/stockbridge/bridge.db").max_connections(8)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `None` selects a private in-memory store.
    pub path: Option<PathBuf>,

    /// Default: 5. Forced to 1 for in-memory stores.
    pub max_connections: u32,

    /// How long a writer waits for SQLite's lock before failing with
    /// [`DbError::Busy`]. Default: 5 seconds
    pub busy_timeout: Duration,

    /// How long a caller waits for a free pooled connection.
    pub acquire_timeout: Duration,

    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: Some(path.into()),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    /// Private store on a single connection; used throughout the tests.
    pub fn in_memory() -> Self {
        DbConfig {
            path: None,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            ..Self::new(PathBuf::new())
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = match &self.path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            None => SqliteConnectOptions::from_str(MEMORY_URL)
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?,
        };
        Ok(options
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new().acquire_timeout(self.acquire_timeout);
        match self.path {
            Some(_) => options
                .max_connections(self.max_connections)
                .min_connections(1)
                .idle_timeout(Duration::from_secs(600)),
            // Dropping the only connection would drop the database with it.
            None => options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the reconciliation store.
///
/// Cheap to clone; every clone shares the pool and the per-entity write
/// locks used by [`BindingRepository::compare_and_swap`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    entity_locks: Arc<KeyedLocks<CanonicalId>>,
}

impl Database {
    /// Opens (creating if needed) the store and applies pending migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        match &config.path {
            Some(path) => info!(path = %path.display(), "Opening reconciliation store"),
            None => debug!("Opening in-memory reconciliation store"),
        }

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        let db = Database {
            pool,
            entity_locks: Arc::new(KeyedLocks::new()),
        };

        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }

        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Canonical identity registry and baselines.
    pub fn entities(&self) -> EntityRepository {
        EntityRepository::new(self.pool.clone())
    }

    /// Platform bindings (the reconciliation store proper).
    pub fn bindings(&self) -> BindingRepository {
        BindingRepository::new(self.pool.clone(), self.entity_locks.clone())
    }

    /// Operation outbox.
    pub fn operations(&self) -> OperationRepository {
        OperationRepository::new(self.pool.clone())
    }

    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository::new(self.pool.clone())
    }

    /// Conflict audit notes.
    pub fn audit(&self) -> AuditRepository {
        AuditRepository::new(self.pool.clone())
    }

    /// Accepted webhook events awaiting reconciliation.
    pub fn inbox(&self) -> InboxRepository {
        InboxRepository::new(self.pool.clone())
    }

    /// Polling resume points.
    pub fn cursors(&self) -> CursorRepository {
        CursorRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        info!("Closing reconciliation store");
        self.pool.close().await;
    }

    /// True when a trivial query round-trips.
    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("stockbridge-{}.db", uuid::Uuid::new_v4()));

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        db.cursors()
            .save(stockbridge_core::Platform::Warehouse, stockbridge_core::EntityKind::Product, "0:x")
            .await
            .unwrap();
        db.close().await;

        let db = Database::new(DbConfig::new(&path).max_connections(2)).await.unwrap();
        let cursor = db
            .cursors()
            .get(stockbridge_core::Platform::Warehouse, stockbridge_core::EntityKind::Product)
            .await
            .unwrap();
        assert_eq!(cursor.as_deref(), Some("0:x"));
        db.close().await;

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_in_memory_config_uses_one_connection() {
        let config = DbConfig::in_memory().max_connections(10);
        assert!(config.path.is_none());
        assert_eq!(config.pool_options().get_max_connections(), 1);
        assert_eq!(DbConfig::new("/tmp/bridge.db").max_connections, 5);
    }
}
