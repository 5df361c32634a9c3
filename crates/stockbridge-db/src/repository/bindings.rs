//! # Binding Repository
//!
//! Lookup and compare-and-swap on platform bindings.
//!
//! ## Compare-and-Swap
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  compare_and_swap(id, platform, expected_hash, update)                  │
//! │                                                                         │
//! │  1. lock(id)                     ← per-entity async mutex               │
//! │  2. BEGIN                                                               │
//! │  3. current = SELECT binding                                            │
//! │  4. expected matches current?                                           │
//! │       (None, None)          → INSERT  version = 1                       │
//! │       (Some(h), Some(h'))   → UPDATE  version += 1   when h == h'       │
//! │       anything else         → ROLLBACK, Conflict { current }            │
//! │  5. every binding of id carries the new hash?                           │
//! │       yes → baseline := update.entity                                   │
//! │  6. COMMIT                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lock makes concurrent swaps on one entity strictly sequential, so of
//! two swaps expecting the same hash exactly one succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use stockbridge_core::{
    CanonicalEntity, CanonicalId, ContentHash, Platform, PlatformBinding, Revision,
};

use super::{parse_canonical_id, parse_platform};
use crate::error::DbResult;
use crate::locks::KeyedLocks;

// =============================================================================
// Types
// =============================================================================

/// New state for a binding.
#[derive(Debug, Clone)]
pub struct BindingUpdate {
    pub native_id: String,
    pub revision: Revision,
    /// Entity state the platform now holds.
    pub entity: CanonicalEntity,
}

/// Result of [`BindingRepository::compare_and_swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped(PlatformBinding),
    /// The binding moved since the caller read it; nothing was written.
    Conflict { current: Option<PlatformBinding> },
}

impl CasOutcome {
    pub fn is_swapped(&self) -> bool {
        matches!(self, CasOutcome::Swapped(_))
    }
}

#[derive(FromRow)]
struct BindingRow {
    canonical_id: String,
    platform: String,
    native_id: String,
    last_synced_revision: String,
    last_synced_hash: String,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BindingRow> for PlatformBinding {
    type Error = crate::error::DbError;

    fn try_from(row: BindingRow) -> Result<Self, Self::Error> {
        Ok(PlatformBinding {
            canonical_id: parse_canonical_id(&row.canonical_id)?,
            platform: parse_platform(&row.platform)?,
            native_id: row.native_id,
            last_synced_revision: Revision::new(row.last_synced_revision),
            last_synced_hash: ContentHash::from_hex(row.last_synced_hash),
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_BINDING: &str = r#"
    SELECT canonical_id, platform, native_id, last_synced_revision,
           last_synced_hash, version, updated_at
    FROM bindings
"#;

// =============================================================================
// Repository
// =============================================================================

/// Repository for platform bindings.
#[derive(Debug, Clone)]
pub struct BindingRepository {
    pool: SqlitePool,

    /// Taken by `compare_and_swap` only. Callers that serialize whole
    /// deliveries per entity need their own set; reusing this one while
    /// swapping deadlocks.
    locks: Arc<KeyedLocks<CanonicalId>>,
}

impl BindingRepository {
    pub fn new(pool: SqlitePool, locks: Arc<KeyedLocks<CanonicalId>>) -> Self {
        BindingRepository { pool, locks }
    }

    /// Binding of `id` on `platform`, if any.
    pub async fn get(&self, id: CanonicalId, platform: Platform) -> DbResult<Option<PlatformBinding>> {
        let row: Option<BindingRow> = sqlx::query_as(&format!(
            "{SELECT_BINDING} WHERE canonical_id = ?1 AND platform = ?2"
        ))
        .bind(id.to_string())
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PlatformBinding::try_from).transpose()
    }

    /// Resolves a native record to its binding.
    pub async fn find_by_native(
        &self,
        platform: Platform,
        native_id: &str,
    ) -> DbResult<Option<PlatformBinding>> {
        let row: Option<BindingRow> = sqlx::query_as(&format!(
            "{SELECT_BINDING} WHERE platform = ?1 AND native_id = ?2"
        ))
        .bind(platform.as_str())
        .bind(native_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PlatformBinding::try_from).transpose()
    }

    /// All bindings of one canonical entity (at most one per platform).
    pub async fn for_entity(&self, id: CanonicalId) -> DbResult<Vec<PlatformBinding>> {
        let rows: Vec<BindingRow> = sqlx::query_as(&format!(
            "{SELECT_BINDING} WHERE canonical_id = ?1 ORDER BY platform"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PlatformBinding::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bindings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Atomically replaces a binding if its hash is still `expected_hash`.
    ///
    /// `expected_hash = None` means "no binding exists yet". The stored
    /// revision never moves backwards.
    pub async fn compare_and_swap(
        &self,
        id: CanonicalId,
        platform: Platform,
        expected_hash: Option<&ContentHash>,
        update: &BindingUpdate,
    ) -> DbResult<CasOutcome> {
        let _guard = self.locks.lock(&id).await;
        let mut tx = self.pool.begin().await?;

        let current: Option<PlatformBinding> = sqlx::query_as::<_, BindingRow>(&format!(
            "{SELECT_BINDING} WHERE canonical_id = ?1 AND platform = ?2"
        ))
        .bind(id.to_string())
        .bind(platform.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(PlatformBinding::try_from)
        .transpose()?;

        let now = Utc::now();
        let new_hash = update.entity.content_hash();

        let swapped = match (&current, expected_hash) {
            (None, None) => {
                sqlx::query(
                    r#"
                    INSERT INTO bindings (
                        canonical_id, platform, native_id, last_synced_revision,
                        last_synced_hash, version, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                    "#,
                )
                .bind(id.to_string())
                .bind(platform.as_str())
                .bind(&update.native_id)
                .bind(update.revision.as_str())
                .bind(new_hash.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;

                PlatformBinding {
                    canonical_id: id,
                    platform,
                    native_id: update.native_id.clone(),
                    last_synced_revision: update.revision.clone(),
                    last_synced_hash: new_hash.clone(),
                    version: 1,
                    updated_at: now,
                }
            }
            (Some(existing), Some(expected)) if existing.last_synced_hash == *expected => {
                let revision = (&existing.last_synced_revision).max(&update.revision).clone();
                let version = existing.version + 1;

                sqlx::query(
                    r#"
                    UPDATE bindings
                    SET native_id = ?1,
                        last_synced_revision = ?2,
                        last_synced_hash = ?3,
                        version = ?4,
                        updated_at = ?5
                    WHERE canonical_id = ?6 AND platform = ?7 AND version = ?8
                    "#,
                )
                .bind(&update.native_id)
                .bind(revision.as_str())
                .bind(new_hash.as_str())
                .bind(version)
                .bind(now)
                .bind(id.to_string())
                .bind(platform.as_str())
                .bind(existing.version)
                .execute(&mut *tx)
                .await?;

                PlatformBinding {
                    canonical_id: id,
                    platform,
                    native_id: update.native_id.clone(),
                    last_synced_revision: revision,
                    last_synced_hash: new_hash.clone(),
                    version,
                    updated_at: now,
                }
            }
            _ => {
                warn!(
                    canonical_id = %id,
                    platform = %platform,
                    expected = ?expected_hash.map(ContentHash::as_str),
                    current = ?current.as_ref().map(|b| b.last_synced_hash.as_str()),
                    "Binding CAS conflict"
                );
                tx.rollback().await?;
                return Ok(CasOutcome::Conflict { current });
            }
        };

        advance_baseline(&mut tx, id, &update.entity, now).await?;
        tx.commit().await?;

        debug!(
            canonical_id = %id,
            platform = %platform,
            version = swapped.version,
            hash = %swapped.last_synced_hash,
            "Binding swapped"
        );

        Ok(CasOutcome::Swapped(swapped))
    }
}

/// Moves the baseline to `entity` when every binding now agrees on its hash.
async fn advance_baseline(
    tx: &mut Transaction<'_, Sqlite>,
    id: CanonicalId,
    entity: &CanonicalEntity,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let hashes: Vec<String> =
        sqlx::query_scalar("SELECT last_synced_hash FROM bindings WHERE canonical_id = ?1")
            .bind(id.to_string())
            .fetch_all(&mut **tx)
            .await?;

    let converged = hashes.iter().all(|h| h == entity.content_hash().as_str());
    if !converged {
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE canonical_entities
        SET baseline_fields = ?1,
            baseline_hash = ?2,
            natural_key = COALESCE(?3, natural_key),
            updated_at = ?4
        WHERE id = ?5
        "#,
    )
    .bind(serde_json::to_string(entity.fields())?)
    .bind(entity.content_hash().as_str())
    .bind(entity.natural_key())
    .bind(now)
    .bind(id.to_string())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
