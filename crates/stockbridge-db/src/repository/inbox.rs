//! # Inbox Repository
//!
//! Durable queue between the webhook endpoint and the sync engine.
//!
//! ```text
//! POST /webhooks/{platform} ──► push() ──► webhook_inbox ──► take() ──► engine
//!                                  │
//!                                  └── full → Saturated (HTTP 429)
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use stockbridge_core::ChangeEvent;

use crate::error::DbResult;

/// Outcome of [`InboxRepository::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxPush {
    Accepted(i64),
    Saturated,
}

/// A queued event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub id: i64,
    pub event: ChangeEvent,
    pub received_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct InboxRow {
    id: i64,
    event: String,
    received_at: DateTime<Utc>,
}

/// Repository for the webhook inbox.
#[derive(Debug, Clone)]
pub struct InboxRepository {
    pool: SqlitePool,
}

impl InboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InboxRepository { pool }
    }

    /// Stores an event unless the inbox already holds `capacity` entries.
    ///
    /// The capacity check and the insert are one statement.
    pub async fn push(&self, event: &ChangeEvent, capacity: u32, now: DateTime<Utc>) -> DbResult<InboxPush> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_inbox (platform, event, received_at)
            SELECT ?1, ?2, ?3
            WHERE (SELECT COUNT(*) FROM webhook_inbox) < ?4
            "#,
        )
        .bind(event.platform.as_str())
        .bind(serde_json::to_string(event)?)
        .bind(now)
        .bind(i64::from(capacity))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(InboxPush::Saturated);
        }
        Ok(InboxPush::Accepted(result.last_insert_rowid()))
    }

    /// Oldest `limit` entries, left in place until [`remove`](Self::remove).
    pub async fn peek(&self, limit: u32) -> DbResult<Vec<InboxEntry>> {
        let rows: Vec<InboxRow> = sqlx::query_as(
            "SELECT id, event, received_at FROM webhook_inbox ORDER BY id ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> DbResult<InboxEntry> {
                Ok(InboxEntry {
                    id: row.id,
                    event: serde_json::from_str(&row.event)?,
                    received_at: row.received_at,
                })
            })
            .collect()
    }

    /// Removes entries once their events are reconciled.
    pub async fn remove(&self, ids: &[i64]) -> DbResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM webhook_inbox WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_inbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;
    use serde_json::json;
    use stockbridge_core::{EntityKind, NativePayload, Platform, Revision};

    fn event(native_id: &str) -> ChangeEvent {
        let body = json!({"sku": "MUG-01", "available": 3})
            .as_object()
            .cloned()
            .unwrap();
        ChangeEvent {
            platform: Platform::Storefront,
            native_id: native_id.to_string(),
            kind: EntityKind::InventoryLevel,
            revision: Revision::new("10"),
            payload: NativePayload::new(EntityKind::InventoryLevel, body),
            changed_at: Utc::now(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_peek_remove() {
        let db = fixtures::database().await;
        let inbox = db.inbox();

        let first = event("s-1");
        assert!(matches!(
            inbox.push(&first, 10, Utc::now()).await.unwrap(),
            InboxPush::Accepted(_)
        ));
        inbox.push(&event("s-2"), 10, Utc::now()).await.unwrap();

        let entries = inbox.peek(1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, first);

        inbox.remove(&[entries[0].id]).await.unwrap();
        assert_eq!(inbox.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_push_saturates_at_capacity() {
        let db = fixtures::database().await;
        let inbox = db.inbox();

        inbox.push(&event("s-1"), 2, Utc::now()).await.unwrap();
        inbox.push(&event("s-2"), 2, Utc::now()).await.unwrap();
        assert_eq!(
            inbox.push(&event("s-3"), 2, Utc::now()).await.unwrap(),
            InboxPush::Saturated
        );
        assert_eq!(inbox.count().await.unwrap(), 2);
    }
}
