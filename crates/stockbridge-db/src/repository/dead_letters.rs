//! # Dead-Letter Repository
//!
//! Operator surface over operations the scheduler gave up on.
//!
//! Records stay until an operator requeues or purges them; nothing here
//! expires on its own.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::info;
use uuid::Uuid;

use stockbridge_core::DeadLetterRecord;

use super::operations::{insert_pending, QueuedOperation};
use super::parse_uuid;
use crate::error::{DbError, DbResult};

#[derive(FromRow)]
struct DeadLetterRow {
    id: String,
    operation: String,
    failure_reason: String,
    attempts: i64,
    first_failed_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = DbError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterRecord {
            id: parse_uuid("id", &row.id)?,
            operation: serde_json::from_str(&row.operation)?,
            failure_reason: row.failure_reason,
            attempts: u32::try_from(row.attempts).map_err(|e| DbError::corrupt("attempts", e))?,
            first_failed_at: row.first_failed_at,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

const SELECT_DEAD_LETTER: &str = r#"
    SELECT id, operation, failure_reason, attempts, first_failed_at, dead_lettered_at
    FROM dead_letters
"#;

/// Repository for dead-lettered operations.
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeadLetterRepository { pool }
    }

    /// Lists records, newest first.
    pub async fn list(&self, limit: u32, offset: u32) -> DbResult<Vec<DeadLetterRecord>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&format!(
            "{SELECT_DEAD_LETTER} ORDER BY dead_lettered_at DESC, id ASC LIMIT ?1 OFFSET ?2"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    pub async fn get(&self, id: Uuid) -> DbResult<Option<DeadLetterRecord>> {
        let row: Option<DeadLetterRow> =
            sqlx::query_as(&format!("{SELECT_DEAD_LETTER} WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(DeadLetterRecord::try_from).transpose()
    }

    /// Puts the operation back on the outbox with a fresh attempt budget.
    ///
    /// Returns `None` when no such record exists.
    pub async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> DbResult<Option<QueuedOperation>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<DeadLetterRow> =
            sqlx::query_as(&format!("{SELECT_DEAD_LETTER} WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = DeadLetterRecord::try_from(row)?;

        let queued = insert_pending(&mut tx, &record.operation, now).await?;

        sqlx::query("DELETE FROM dead_letters WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            dead_letter_id = %id,
            op_id = %queued.id,
            canonical_id = %record.operation.canonical_id,
            "Dead letter requeued"
        );

        Ok(Some(queued))
    }

    /// Deletes a record. Returns whether it existed.
    pub async fn purge(&self, id: Uuid) -> DbResult<bool> {
        let affected = sqlx::query("DELETE FROM dead_letters WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected > 0 {
            info!(dead_letter_id = %id, "Dead letter purged");
        }
        Ok(affected > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
