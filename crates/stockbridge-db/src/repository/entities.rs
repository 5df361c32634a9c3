//! # Entity Repository
//!
//! Canonical identity registry.
//!
//! Ids are allocated here and nowhere else. The baseline columns are written
//! only by [`BindingRepository::compare_and_swap`](super::bindings::BindingRepository::compare_and_swap)
//! when every binding of an entity agrees on one hash.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use stockbridge_core::{CanonicalEntity, CanonicalId, EntityKind, Fields, Platform};

use super::{parse_canonical_id, parse_kind};
use crate::error::DbResult;

/// A registered canonical entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: CanonicalId,
    pub kind: EntityKind,
    pub natural_key: Option<String>,
    /// Last converged state, `None` until the first convergence.
    pub baseline: Option<CanonicalEntity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct EntityRow {
    id: String,
    kind: String,
    natural_key: Option<String>,
    baseline_fields: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn into_record(self) -> DbResult<EntityRecord> {
        let id = parse_canonical_id(&self.id)?;
        let kind = parse_kind(&self.kind)?;
        let baseline = match self.baseline_fields {
            Some(json) => {
                let fields: Fields = serde_json::from_str(&json)?;
                Some(CanonicalEntity::with_id(id, kind, fields))
            }
            None => None,
        };
        Ok(EntityRecord {
            id,
            kind,
            natural_key: self.natural_key,
            baseline,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Repository for canonical identities.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntityRepository { pool }
    }

    /// Allocates a new canonical id.
    pub async fn register(&self, kind: EntityKind, natural_key: Option<&str>) -> DbResult<CanonicalId> {
        let id = CanonicalId::new();
        let now = Utc::now();

        debug!(canonical_id = %id, kind = %kind, natural_key = ?natural_key, "Registering entity");

        sqlx::query(
            r#"
            INSERT INTO canonical_entities (id, kind, natural_key, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(natural_key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, id: CanonicalId) -> DbResult<Option<EntityRecord>> {
        let row: Option<EntityRow> = sqlx::query_as(
            r#"
            SELECT id, kind, natural_key, baseline_fields, created_at, updated_at
            FROM canonical_entities
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(EntityRow::into_record).transpose()
    }

    /// Oldest entity with this natural key that has no binding on `platform`.
    ///
    /// Used to pair a record seen for the first time with its counterpart
    /// already known from the other platform.
    pub async fn find_unbound_by_natural_key(
        &self,
        kind: EntityKind,
        natural_key: &str,
        platform: Platform,
    ) -> DbResult<Option<CanonicalId>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT e.id
            FROM canonical_entities e
            WHERE e.kind = ?1
              AND e.natural_key = ?2
              AND NOT EXISTS (
                  SELECT 1 FROM bindings b
                  WHERE b.canonical_id = e.id AND b.platform = ?3
              )
            ORDER BY e.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(natural_key)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        id.as_deref().map(parse_canonical_id).transpose()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canonical_entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;

    #[tokio::test]
    async fn test_register_and_get() {
        let db = fixtures::database().await;
        let repo = db.entities();

        let id = repo.register(EntityKind::Variant, Some("MUG-01")).await.unwrap();
        let record = repo.get(id).await.unwrap().unwrap();

        assert_eq!(record.kind, EntityKind::Variant);
        assert_eq!(record.natural_key.as_deref(), Some("MUG-01"));
        assert!(record.baseline.is_none());
        assert!(repo.get(CanonicalId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let db = fixtures::database().await;
        let a = db.entities().register(EntityKind::Order, None).await.unwrap();
        let b = db.entities().register(EntityKind::Order, None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(db.entities().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_find_unbound_by_natural_key() {
        let db = fixtures::database().await;
        let id = db
            .entities()
            .register(EntityKind::InventoryLevel, Some("MUG-01"))
            .await
            .unwrap();

        let found = db
            .entities()
            .find_unbound_by_natural_key(EntityKind::InventoryLevel, "MUG-01", Platform::Warehouse)
            .await
            .unwrap();
        assert_eq!(found, Some(id));

        let other_kind = db
            .entities()
            .find_unbound_by_natural_key(EntityKind::Variant, "MUG-01", Platform::Warehouse)
            .await
            .unwrap();
        assert_eq!(other_kind, None);
    }
}
