//! # Operation Repository
//!
//! Durable outbox of [`SyncOperation`]s awaiting delivery.
//!
//! ## Lifecycle
//! ```text
//!            enqueue
//!               │
//!               ▼
//!   ┌──────► pending ──── claim_due ────► in_flight
//!   │           ▲                              │
//!   │           │ recover_in_flight            ├── complete ──► (deleted)
//!   │           │ (startup)                    │
//!   │           └──────────────────────────────┤
//!   │                                          ├── dead_letter ──► dead_letters
//!   └────────────── reschedule ◄───────────────┘
//! ```
//!
//! Enqueueing supersedes any still-pending operation for the same entity and
//! target: only the newest desired state is worth delivering. In-flight rows
//! are never superseded.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use stockbridge_core::{CanonicalId, DeadLetterRecord, Platform, SyncOperation};

use super::parse_uuid;
use crate::error::{DbError, DbResult};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    InFlight,
}

impl OperationState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InFlight => "in_flight",
        }
    }

    fn parse(value: &str) -> DbResult<Self> {
        match value {
            "pending" => Ok(OperationState::Pending),
            "in_flight" => Ok(OperationState::InFlight),
            other => Err(DbError::corrupt("state", format!("unknown state {other:?}"))),
        }
    }
}

/// An outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub operation: SyncOperation,
    pub state: OperationState,
    /// Failed deliveries so far.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct OperationRow {
    id: String,
    operation: String,
    state: String,
    attempts: i64,
    next_attempt_ms: i64,
    last_error: Option<String>,
    first_failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OperationRow> for QueuedOperation {
    type Error = DbError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        Ok(QueuedOperation {
            id: parse_uuid("id", &row.id)?,
            operation: serde_json::from_str(&row.operation)?,
            state: OperationState::parse(&row.state)?,
            attempts: u32::try_from(row.attempts).map_err(|e| DbError::corrupt("attempts", e))?,
            next_attempt_at: from_millis(row.next_attempt_ms)?,
            last_error: row.last_error,
            first_failed_at: row.first_failed_at,
            created_at: row.created_at,
        })
    }
}

fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::corrupt("next_attempt_ms", format!("{ms} out of range")))
}

const SELECT_OPERATION: &str = r#"
    SELECT id, operation, state, attempts, next_attempt_ms, last_error,
           first_failed_at, created_at
    FROM sync_operations
"#;

/// Inserts a fresh pending row, due immediately.
pub(crate) async fn insert_pending(
    tx: &mut Transaction<'_, Sqlite>,
    operation: &SyncOperation,
    now: DateTime<Utc>,
) -> DbResult<QueuedOperation> {
    let queued = QueuedOperation {
        id: Uuid::new_v4(),
        operation: operation.clone(),
        state: OperationState::Pending,
        attempts: 0,
        next_attempt_at: now,
        last_error: None,
        first_failed_at: None,
        created_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO sync_operations (
            id, canonical_id, target, operation, idempotency_token,
            state, attempts, next_attempt_ms, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)
        "#,
    )
    .bind(queued.id.to_string())
    .bind(operation.canonical_id.to_string())
    .bind(operation.target.as_str())
    .bind(serde_json::to_string(operation)?)
    .bind(operation.idempotency_token().as_str())
    .bind(now.timestamp_millis())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(queued)
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the operation outbox.
#[derive(Debug, Clone)]
pub struct OperationRepository {
    pool: SqlitePool,
}

impl OperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OperationRepository { pool }
    }

    /// Queues an operation, replacing pending ones for the same entity and target.
    pub async fn enqueue(&self, operation: &SyncOperation, now: DateTime<Utc>) -> DbResult<QueuedOperation> {
        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(
            r#"
            DELETE FROM sync_operations
            WHERE canonical_id = ?1 AND target = ?2 AND state = 'pending'
            "#,
        )
        .bind(operation.canonical_id.to_string())
        .bind(operation.target.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let queued = insert_pending(&mut tx, operation, now).await?;
        tx.commit().await?;

        debug!(
            op_id = %queued.id,
            canonical_id = %operation.canonical_id,
            target = %operation.target,
            superseded,
            "Operation enqueued"
        );

        Ok(queued)
    }

    pub async fn get(&self, id: Uuid) -> DbResult<Option<QueuedOperation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!("{SELECT_OPERATION} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedOperation::try_from).transpose()
    }

    /// Claims up to `limit` due pending operations for `target`, oldest first.
    ///
    /// Each claimed row moves to `in_flight`; a row claimed by a concurrent
    /// caller is skipped.
    pub async fn claim_due(
        &self,
        target: Platform,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<QueuedOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "{SELECT_OPERATION} WHERE state = 'pending' AND target = ?1 AND next_attempt_ms <= ?2
             ORDER BY next_attempt_ms ASC, created_at ASC LIMIT ?3"
        ))
        .bind(target.as_str())
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut queued = QueuedOperation::try_from(row)?;
            let affected = sqlx::query(
                "UPDATE sync_operations SET state = 'in_flight' WHERE id = ?1 AND state = 'pending'",
            )
            .bind(queued.id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if affected == 1 {
                queued.state = OperationState::InFlight;
                claimed.push(queued);
            }
        }

        Ok(claimed)
    }

    /// Removes a delivered (or obsolete) operation.
    pub async fn complete(&self, id: Uuid) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_operations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns an in-flight operation to `pending` after a retryable failure.
    pub async fn reschedule(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        first_failed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let affected = sqlx::query(
            r#"
            UPDATE sync_operations
            SET state = 'pending',
                attempts = ?1,
                next_attempt_ms = ?2,
                last_error = ?3,
                first_failed_at = COALESCE(first_failed_at, ?4)
            WHERE id = ?5
            "#,
        )
        .bind(i64::from(attempts))
        .bind(next_attempt_at.timestamp_millis())
        .bind(error)
        .bind(first_failed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::not_found("sync_operation", id.to_string()));
        }
        Ok(())
    }

    /// Moves an operation to the dead-letter queue.
    pub async fn dead_letter(
        &self,
        id: Uuid,
        reason: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> DbResult<DeadLetterRecord> {
        let mut tx = self.pool.begin().await?;

        let row: Option<OperationRow> = sqlx::query_as(&format!("{SELECT_OPERATION} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let queued = match row {
            Some(row) => QueuedOperation::try_from(row)?,
            None => return Err(DbError::not_found("sync_operation", id.to_string())),
        };

        let record = DeadLetterRecord {
            id: queued.id,
            operation: queued.operation,
            failure_reason: reason.to_string(),
            attempts,
            first_failed_at: queued.first_failed_at.unwrap_or(now),
            dead_lettered_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, canonical_id, target, operation, failure_reason,
                attempts, first_failed_at, dead_lettered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.operation.canonical_id.to_string())
        .bind(record.operation.target.as_str())
        .bind(serde_json::to_string(&record.operation)?)
        .bind(&record.failure_reason)
        .bind(i64::from(record.attempts))
        .bind(record.first_failed_at)
        .bind(record.dead_lettered_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sync_operations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            op_id = %id,
            canonical_id = %record.operation.canonical_id,
            target = %record.operation.target,
            attempts,
            reason,
            "Operation dead-lettered"
        );

        Ok(record)
    }

    /// Returns rows left `in_flight` by a previous process to `pending`.
    pub async fn recover_in_flight(&self) -> DbResult<u64> {
        let recovered = sqlx::query("UPDATE sync_operations SET state = 'pending' WHERE state = 'in_flight'")
            .execute(&self.pool)
            .await?
            .rows_affected();

        if recovered > 0 {
            info!(recovered, "Recovered in-flight operations");
        }
        Ok(recovered)
    }

    /// Operations queued for one entity, any state.
    pub async fn for_entity(&self, id: CanonicalId) -> DbResult<Vec<QueuedOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "{SELECT_OPERATION} WHERE canonical_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedOperation::try_from).collect()
    }

    /// Number of rows in the given state.
    pub async fn count(&self, state: OperationState) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_operations WHERE state = ?1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures::{self, inventory};
    use chrono::Duration;
    use stockbridge_core::EntityKind;

    async fn operation(db: &crate::Database, qty: i64) -> SyncOperation {
        let id = db.entities().register(EntityKind::InventoryLevel, None).await.unwrap();
        SyncOperation {
            canonical_id: id,
            target: Platform::Warehouse,
            desired: inventory("MUG-01", qty).bind(id).unwrap(),
            based_on_hash: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let db = fixtures::database().await;
        let op = operation(&db, 5).await;
        let now = Utc::now();

        let queued = db.operations().enqueue(&op, now).await.unwrap();
        assert_eq!(queued.state, OperationState::Pending);

        // Other platform sees nothing
        let none = db.operations().claim_due(Platform::Storefront, now, 10).await.unwrap();
        assert!(none.is_empty());

        let claimed = db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].operation, op);
        assert_eq!(claimed[0].state, OperationState::InFlight);

        // Already claimed
        let again = db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap();
        assert!(again.is_empty());

        db.operations().complete(queued.id).await.unwrap();
        assert!(db.operations().get(queued.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_supersedes_pending() {
        let db = fixtures::database().await;
        let first = operation(&db, 5).await;
        let mut second = first.clone();
        second.desired = inventory("MUG-01", 9).bind(first.canonical_id).unwrap();
        let now = Utc::now();

        db.operations().enqueue(&first, now).await.unwrap();
        db.operations().enqueue(&second, now).await.unwrap();

        let queued = db.operations().for_entity(first.canonical_id).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, second);
    }

    #[tokio::test]
    async fn test_in_flight_is_not_superseded() {
        let db = fixtures::database().await;
        let first = operation(&db, 5).await;
        let now = Utc::now();

        db.operations().enqueue(&first, now).await.unwrap();
        db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap();
        db.operations().enqueue(&first, now).await.unwrap();

        let queued = db.operations().for_entity(first.canonical_id).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(db.operations().count(OperationState::InFlight).await.unwrap(), 1);
        assert_eq!(db.operations().count(OperationState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_delays_claim() {
        let db = fixtures::database().await;
        let op = operation(&db, 5).await;
        let now = Utc::now();

        let queued = db.operations().enqueue(&op, now).await.unwrap();
        db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap();
        db.operations()
            .reschedule(queued.id, 1, now + Duration::seconds(30), "503", now)
            .await
            .unwrap();

        assert!(db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap().is_empty());

        let later = db
            .operations()
            .claim_due(Platform::Warehouse, now + Duration::seconds(31), 10)
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].attempts, 1);
        assert_eq!(later[0].last_error.as_deref(), Some("503"));
        assert!(later[0].first_failed_at.is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_moves_row() {
        let db = fixtures::database().await;
        let op = operation(&db, 5).await;
        let now = Utc::now();

        let queued = db.operations().enqueue(&op, now).await.unwrap();
        let record = db
            .operations()
            .dead_letter(queued.id, "422 Unprocessable", 1, now)
            .await
            .unwrap();

        assert_eq!(record.id, queued.id);
        assert_eq!(record.operation, op);
        assert!(db.operations().get(queued.id).await.unwrap().is_none());
        assert_eq!(db.dead_letters().count().await.unwrap(), 1);

        let missing = db.operations().dead_letter(Uuid::new_v4(), "x", 1, now).await;
        assert!(matches!(missing, Err(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let db = fixtures::database().await;
        let op = operation(&db, 5).await;
        let now = Utc::now();

        db.operations().enqueue(&op, now).await.unwrap();
        db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap();

        assert_eq!(db.operations().recover_in_flight().await.unwrap(), 1);
        assert_eq!(db.operations().claim_due(Platform::Warehouse, now, 10).await.unwrap().len(), 1);
    }
}
