//! # Cursor Repository
//!
//! Where each poller resumes after a restart.

use chrono::Utc;
use sqlx::SqlitePool;

use stockbridge_core::{EntityKind, Platform};

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct CursorRepository {
    pool: SqlitePool,
}

impl CursorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CursorRepository { pool }
    }

    pub async fn get(&self, platform: Platform, kind: EntityKind) -> DbResult<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM sync_cursors WHERE platform = ?1 AND kind = ?2")
                .bind(platform.as_str())
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    pub async fn save(&self, platform: Platform, kind: EntityKind, cursor: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (platform, kind, cursor, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (platform, kind) DO UPDATE
            SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(platform.as_str())
        .bind(kind.as_str())
        .bind(cursor)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::fixtures;
    use stockbridge_core::{EntityKind, Platform};

    #[tokio::test]
    async fn test_save_overwrites() {
        let db = fixtures::database().await;
        let cursors = db.cursors();

        assert!(cursors.get(Platform::Warehouse, EntityKind::Order).await.unwrap().is_none());

        cursors.save(Platform::Warehouse, EntityKind::Order, "0:100").await.unwrap();
        cursors.save(Platform::Warehouse, EntityKind::Order, "50:200").await.unwrap();

        assert_eq!(
            cursors.get(Platform::Warehouse, EntityKind::Order).await.unwrap().as_deref(),
            Some("50:200")
        );
        assert!(cursors.get(Platform::Storefront, EntityKind::Order).await.unwrap().is_none());
    }
}
