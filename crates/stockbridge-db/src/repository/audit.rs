//! # Audit Repository
//!
//! Field values discarded by conflict resolution.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use stockbridge_core::{AuditNote, CanonicalId, FieldValue, ResolutionRule};

use super::{parse_canonical_id, parse_platform};
use crate::error::{DbError, DbResult};

/// A stored audit note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub id: i64,
    pub note: AuditNote,
    pub recorded_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct AuditRow {
    id: i64,
    canonical_id: String,
    field: String,
    rule: String,
    winner: String,
    kept: Option<String>,
    discarded: Option<String>,
    recorded_at: DateTime<Utc>,
}

fn parse_rule(value: &str) -> DbResult<ResolutionRule> {
    match value {
        "last_writer_wins" => Ok(ResolutionRule::LastWriterWins),
        "platform_priority" => Ok(ResolutionRule::PlatformPriority),
        other => Err(DbError::corrupt("rule", format!("unknown rule {other:?}"))),
    }
}

fn parse_value(json: Option<String>) -> DbResult<Option<FieldValue>> {
    json.map(|j| serde_json::from_str(&j)).transpose().map_err(DbError::from)
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = DbError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditRecord {
            id: row.id,
            note: AuditNote {
                canonical_id: parse_canonical_id(&row.canonical_id)?,
                field: row.field,
                rule: parse_rule(&row.rule)?,
                winner: parse_platform(&row.winner)?,
                kept: parse_value(row.kept)?,
                discarded: parse_value(row.discarded)?,
            },
            recorded_at: row.recorded_at,
        })
    }
}

/// Repository for conflict audit notes.
#[derive(Debug, Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AuditRepository { pool }
    }

    pub async fn record(&self, notes: &[AuditNote], now: DateTime<Utc>) -> DbResult<()> {
        if notes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for note in notes {
            let kept = note.kept.as_ref().map(serde_json::to_string).transpose()?;
            let discarded = note.discarded.as_ref().map(serde_json::to_string).transpose()?;

            sqlx::query(
                r#"
                INSERT INTO audit_notes (canonical_id, field, rule, winner, kept, discarded, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(note.canonical_id.to_string())
            .bind(&note.field)
            .bind(note.rule.as_str())
            .bind(note.winner.as_str())
            .bind(kept)
            .bind(discarded)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Notes for one entity, oldest first.
    pub async fn for_entity(&self, id: CanonicalId) -> DbResult<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, canonical_id, field, rule, winner, kept, discarded, recorded_at
            FROM audit_notes
            WHERE canonical_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;
    use stockbridge_core::{Money, Platform};

    #[tokio::test]
    async fn test_record_and_read_back() {
        let db = fixtures::database().await;
        let id = CanonicalId::new();
        let note = AuditNote {
            canonical_id: id,
            field: "price".to_string(),
            rule: ResolutionRule::PlatformPriority,
            winner: Platform::Warehouse,
            kept: Some(FieldValue::Money(Money::from_cents(1999))),
            discarded: Some(FieldValue::Money(Money::from_cents(1899))),
        };

        db.audit().record(&[note.clone()], Utc::now()).await.unwrap();
        db.audit().record(&[], Utc::now()).await.unwrap();

        let records = db.audit().for_entity(id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].note, note);
        assert!(db.audit().for_entity(CanonicalId::new()).await.unwrap().is_empty());
    }
}
