//! # Sync Executor
//!
//! Applies one [`SyncOperation`] to its target platform and, once the
//! platform confirms, records the new state through compare-and-swap.
//!
//! ## Apply / Confirm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  apply(op)                                                             │
//! │    1. binding = bindings.get(id, target)     create vs update;         │
//! │                                              moved → Superseded        │
//! │    2. payload = mapper.to_native(desired)    failure → Rejected        │
//! │    3. limiter.acquire()                      per-platform token bucket │
//! │    4. api.update / api.create  (+ Idempotency-Key)                     │
//! │         ok            → Applied                                        │
//! │         408/429/5xx,  → Retryable { retry_after }                      │
//! │         timeout                                                         │
//! │         other 4xx     → Rejected                                       │
//! │                                                                         │
//! │  confirm(op, applied)                                                  │
//! │    CAS(target, expected = op.based_on_hash)                            │
//! │         swapped  → Confirmed                                           │
//! │         conflict → Superseded (someone else moved the binding)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The binding is never touched before the platform has confirmed the write.
//!
//! The idempotency key is derived from the state an operation was planned
//! on, so a binding that returns to an earlier hash reuses an earlier key. A
//! platform replaying its cached reply for that key echoes the old state;
//! `apply` logs the fields that disagree and reports them in
//! [`Applied::diverged`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use stockbridge_core::{Mapper, Platform, PlatformBinding, Revision, SyncOperation};
use stockbridge_db::{BindingUpdate, CasOutcome, Database};

use crate::api::{NativeRecord, PlatformApi};
use crate::error::{SyncError, SyncResult};
use crate::rate_limit::TokenBucket;

// =============================================================================
// Outcomes
// =============================================================================

/// What the target platform reported for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub native_id: String,
    pub revision: Revision,
    pub changed_at: DateTime<Utc>,
    /// Desired fields the reply did not echo.
    pub diverged: Vec<String>,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Applied),
    /// Will never succeed as-is; goes straight to the dead-letter queue.
    Rejected(String),
    /// Worth another attempt; `retry_after` is the platform's own hint.
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The target binding moved after the operation was planned; nothing
    /// was sent.
    Superseded,
}

/// Result of recording a confirmed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed(PlatformBinding),
    /// The binding moved since the operation was planned.
    Superseded { current: Option<PlatformBinding> },
}

// =============================================================================
// Executor
// =============================================================================

/// Delivers operations to one platform.
#[derive(Clone)]
pub struct Executor {
    /// Target platform; operations for the other one are refused.
    platform: Platform,

    api: Arc<dyn PlatformApi>,

    mapper: Arc<Mapper>,

    /// Shared by every worker writing to this platform.
    limiter: Arc<TokenBucket>,

    db: Database,
}

impl Executor {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        mapper: Arc<Mapper>,
        limiter: Arc<TokenBucket>,
        db: Database,
    ) -> Self {
        Executor {
            platform: api.platform(),
            api,
            mapper,
            limiter,
            db,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Sends the operation's desired state to the platform.
    pub async fn apply(&self, op: &SyncOperation) -> SyncResult<ApplyOutcome> {
        if op.target != self.platform {
            return Err(SyncError::Domain(format!(
                "operation for {} routed to {} executor",
                op.target, self.platform
            )));
        }

        let binding = self.db.bindings().get(op.canonical_id, self.platform).await?;
        if binding.as_ref().map(|b| &b.last_synced_hash) != op.based_on_hash.as_ref() {
            debug!(canonical_id = %op.canonical_id, target = %self.platform, "Operation planned on stale binding");
            return Ok(ApplyOutcome::Superseded);
        }

        let payload = match self.mapper.to_native(self.platform, &op.desired) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(canonical_id = %op.canonical_id, target = %self.platform, error = %e, "Cannot map operation");
                return Ok(ApplyOutcome::Rejected(format!("mapping failed: {e}")));
            }
        };

        let key = op.idempotency_token();
        let kind = op.kind();

        self.limiter.acquire().await;

        let result = match &binding {
            Some(b) => {
                debug!(canonical_id = %op.canonical_id, native_id = %b.native_id, "Updating record");
                self.api.update(kind, &b.native_id, payload.body(), &key).await
            }
            None => {
                debug!(canonical_id = %op.canonical_id, kind = %kind, "Creating record");
                self.api.create(kind, payload.body(), &key).await
            }
        };

        Ok(match result {
            Ok(record) => {
                let diverged = self.diverged_fields(op, &record);
                if !diverged.is_empty() {
                    warn!(
                        canonical_id = %op.canonical_id,
                        target = %self.platform,
                        native_id = %record.id,
                        idempotency_key = %key,
                        fields = ?diverged,
                        "Write reply disagrees with desired state, key may have been replayed"
                    );
                }
                info!(
                    canonical_id = %op.canonical_id,
                    target = %self.platform,
                    native_id = %record.id,
                    revision = %record.revision,
                    "Platform accepted write"
                );
                ApplyOutcome::Applied(Applied {
                    native_id: record.id,
                    revision: record.revision,
                    changed_at: record.changed_at,
                    diverged,
                })
            }
            Err(e) if e.is_retryable() => ApplyOutcome::Retryable {
                reason: e.to_string(),
                retry_after: e.retry_after(),
            },
            Err(e) => ApplyOutcome::Rejected(e.to_string()),
        })
    }

    /// Desired fields whose value the platform's reply does not carry. A
    /// reply that does not map is not second-guessed.
    fn diverged_fields(&self, op: &SyncOperation, record: &NativeRecord) -> Vec<String> {
        let Ok(echoed) = self.mapper.to_canonical(self.platform, &record.payload()) else {
            return Vec::new();
        };
        op.desired
            .fields()
            .iter()
            .filter(|(name, value)| echoed.get(name.as_str()) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Records a confirmed write with compare-and-swap on the target binding.
    pub async fn confirm(&self, op: &SyncOperation, applied: &Applied) -> SyncResult<ConfirmOutcome> {
        let update = BindingUpdate {
            native_id: applied.native_id.clone(),
            revision: applied.revision.clone(),
            entity: op.desired.clone(),
        };

        let outcome = self
            .db
            .bindings()
            .compare_and_swap(op.canonical_id, self.platform, op.based_on_hash.as_ref(), &update)
            .await?;

        Ok(match outcome {
            CasOutcome::Swapped(binding) => ConfirmOutcome::Confirmed(binding),
            CasOutcome::Conflict { current } => {
                warn!(canonical_id = %op.canonical_id, target = %self.platform, "Write superseded before confirm");
                ConfirmOutcome::Superseded { current }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::testing::FakePlatform;
    use serde_json::json;
    use stockbridge_core::{CanonicalEntity, CanonicalId, EntityKind, FieldValue, Fields};
    use stockbridge_db::DbConfig;

    fn inventory(sku: &str, qty: i64) -> CanonicalEntity {
        let mut fields = Fields::new();
        fields.insert("sku".into(), FieldValue::Text(sku.into()));
        fields.insert("quantity".into(), FieldValue::Integer(qty));
        CanonicalEntity::new(EntityKind::InventoryLevel, fields)
    }

    async fn setup() -> (Database, Arc<FakePlatform>, Executor) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fake = Arc::new(FakePlatform::new(Platform::Warehouse));
        let executor = Executor::new(
            fake.clone(),
            Arc::new(Mapper::new()),
            Arc::new(TokenBucket::new(100, 100.0)),
            db.clone(),
        );
        (db, fake, executor)
    }

    async fn create_op(db: &Database, qty: i64) -> SyncOperation {
        let id = db
            .entities()
            .register(EntityKind::InventoryLevel, Some("MUG-01"))
            .await
            .unwrap();
        SyncOperation {
            canonical_id: id,
            target: Platform::Warehouse,
            desired: inventory("MUG-01", qty),
            based_on_hash: None,
        }
    }

    #[tokio::test]
    async fn test_apply_creates_then_confirm_binds() {
        let (db, fake, executor) = setup().await;
        let op = create_op(&db, 8).await;

        let ApplyOutcome::Applied(applied) = executor.apply(&op).await.unwrap() else {
            panic!("expected Applied");
        };
        assert_eq!(fake.body(&applied.native_id).unwrap()["stock"], 8);
        assert_eq!(fake.body(&applied.native_id).unwrap()["article"], "MUG-01");

        let ConfirmOutcome::Confirmed(binding) = executor.confirm(&op, &applied).await.unwrap() else {
            panic!("expected Confirmed");
        };
        assert_eq!(binding.native_id, applied.native_id);
        assert_eq!(&binding.last_synced_hash, op.desired.content_hash());
    }

    #[tokio::test]
    async fn test_apply_updates_bound_record() {
        let (db, fake, executor) = setup().await;
        let native = fake.seed(EntityKind::InventoryLevel, json!({"article": "MUG-01", "stock": 2}));
        let op = create_op(&db, 2).await;

        let update = BindingUpdate {
            native_id: native.clone(),
            revision: Revision::new("1"),
            entity: inventory("MUG-01", 2),
        };
        db.bindings()
            .compare_and_swap(op.canonical_id, Platform::Warehouse, None, &update)
            .await
            .unwrap();

        let op = SyncOperation {
            desired: inventory("MUG-01", 5),
            based_on_hash: Some(inventory("MUG-01", 2).content_hash().clone()),
            ..op
        };
        let outcome = executor.apply(&op).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(ref a) if a.native_id == native));
        assert_eq!(fake.body(&native).unwrap()["stock"], 5);
        assert_eq!(fake.ids(EntityKind::InventoryLevel).len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_apply_writes_once() {
        let (db, fake, executor) = setup().await;
        let op = create_op(&db, 8).await;

        let first = executor.apply(&op).await.unwrap();
        let second = executor.apply(&op).await.unwrap();

        assert_eq!(first, second);
        assert!(matches!(first, ApplyOutcome::Applied(ref a) if a.diverged.is_empty()));
        assert_eq!(fake.writes(), 1);
        assert_eq!(fake.write_calls(), 2);
        assert_eq!(fake.ids(EntityKind::InventoryLevel).len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_reply_for_different_state_is_flagged() {
        let (db, fake, executor) = setup().await;
        let op = create_op(&db, 8).await;
        executor.apply(&op).await.unwrap();

        // Same entity, target and base hash, so the same key, but new content
        let later = SyncOperation {
            desired: inventory("MUG-01", 3),
            ..op.clone()
        };
        assert_eq!(later.idempotency_token(), op.idempotency_token());

        let ApplyOutcome::Applied(applied) = executor.apply(&later).await.unwrap() else {
            panic!("expected Applied");
        };
        assert_eq!(applied.diverged, vec!["quantity".to_string()]);
        assert_eq!(fake.writes(), 1);
        assert_eq!(fake.body(&applied.native_id).unwrap()["stock"], 8);
    }

    #[tokio::test]
    async fn test_classifies_platform_errors() {
        let (db, fake, executor) = setup().await;
        let op = create_op(&db, 8).await;

        fake.fail_next([
            ApiError::Status {
                status: 503,
                message: "busy".into(),
                retry_after: Some(Duration::from_secs(4)),
            },
            ApiError::Timeout,
            ApiError::Status {
                status: 422,
                message: "article is invalid".into(),
                retry_after: None,
            },
        ]);

        assert_eq!(
            executor.apply(&op).await.unwrap(),
            ApplyOutcome::Retryable {
                reason: "HTTP 503: busy".into(),
                retry_after: Some(Duration::from_secs(4)),
            }
        );
        assert!(matches!(
            executor.apply(&op).await.unwrap(),
            ApplyOutcome::Retryable { retry_after: None, .. }
        ));
        assert_eq!(
            executor.apply(&op).await.unwrap(),
            ApplyOutcome::Rejected("HTTP 422: article is invalid".into())
        );
        assert_eq!(fake.writes(), 0);
    }

    #[tokio::test]
    async fn test_unmappable_operation_is_rejected_without_call() {
        let (db, fake, executor) = setup().await;
        let mut op = create_op(&db, 8).await;

        let mut fields = op.desired.fields().clone();
        fields.insert("colour".into(), FieldValue::Text("red".into()));
        op.desired = CanonicalEntity::new(EntityKind::InventoryLevel, fields);

        let outcome = executor.apply(&op).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(ref r) if r.contains("colour")));
        assert_eq!(fake.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_confirm_reports_superseded() {
        let (db, _fake, executor) = setup().await;
        let op = create_op(&db, 8).await;

        // Somebody bound the entity first
        let other = BindingUpdate {
            native_id: "wh-99".into(),
            revision: Revision::new("3"),
            entity: inventory("MUG-01", 1),
        };
        db.bindings()
            .compare_and_swap(op.canonical_id, Platform::Warehouse, None, &other)
            .await
            .unwrap();

        let applied = Applied {
            native_id: "wh-100".into(),
            revision: Revision::new("4"),
            changed_at: Utc::now(),
            diverged: Vec::new(),
        };
        let outcome = executor.confirm(&op, &applied).await.unwrap();
        assert!(matches!(
            outcome,
            ConfirmOutcome::Superseded { current: Some(ref b) } if b.native_id == "wh-99"
        ));
    }

    #[tokio::test]
    async fn test_stale_operation_is_not_sent() {
        let (db, fake, executor) = setup().await;
        let op = create_op(&db, 8).await;

        let other = BindingUpdate {
            native_id: "wh-99".into(),
            revision: Revision::new("3"),
            entity: inventory("MUG-01", 1),
        };
        db.bindings()
            .compare_and_swap(op.canonical_id, Platform::Warehouse, None, &other)
            .await
            .unwrap();

        assert_eq!(executor.apply(&op).await.unwrap(), ApplyOutcome::Superseded);
        assert_eq!(fake.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_target_is_an_error() {
        let (_db, _fake, executor) = setup().await;
        let op = SyncOperation {
            canonical_id: CanonicalId::new(),
            target: Platform::Storefront,
            desired: inventory("MUG-01", 1),
            based_on_hash: None,
        };
        assert!(executor.apply(&op).await.is_err());
    }
}
