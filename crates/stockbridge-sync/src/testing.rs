//! In-memory [`PlatformApi`] and a wired-up [`Harness`] for tests.
//!
//! Records live in a map keyed by native id. Every write or edit bumps a
//! global revision counter. Listing follows the same contract as the real
//! clients: the cursor is the newest revision seen, and anything changed after
//! it is listed again, oldest first. Writes carrying an idempotency key that
//! already succeeded return the stored result without touching the record.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use stockbridge_core::{ConflictPolicy, EntityKind, IdempotencyToken, JsonMap, Mapper, Platform, Revision};
use stockbridge_db::{Database, DbConfig, KeyedLocks};

use crate::api::{ApiError, NativeRecord, PlatformApi, RecordPage};
use crate::engine::SyncEngine;
use crate::executor::Executor;
use crate::rate_limit::TokenBucket;
use crate::scheduler::{RetryPolicy, Scheduler};
use crate::source::ChangeSource;
use crate::storefront::StorefrontSource;
use crate::warehouse::WarehouseSource;

#[derive(Debug, Clone)]
struct Stored {
    kind: EntityKind,
    revision: u64,
    changed_at: DateTime<Utc>,
    body: JsonMap,
}

#[derive(Debug, Default)]
struct FakeState {
    records: BTreeMap<String, Stored>,
    clock: u64,
    failures: VecDeque<ApiError>,
    replies: HashMap<String, NativeRecord>,
    writes: usize,
    calls: usize,
}

/// Holds writes until released; see [`FakePlatform::hold_writes`].
#[derive(Default)]
pub struct WriteGate {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakePlatform {
    platform: Platform,
    epoch: DateTime<Utc>,
    state: Mutex<FakeState>,
    gate: Mutex<Option<Arc<WriteGate>>>,
}

fn to_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        other => panic!("fake record must be an object, got {other}"),
    }
}

impl FakePlatform {
    pub fn new(platform: Platform) -> Self {
        FakePlatform {
            platform,
            epoch: Utc::now() - Duration::days(1),
            state: Mutex::new(FakeState::default()),
            gate: Mutex::new(None),
        }
    }

    fn record(id: &str, stored: &Stored) -> NativeRecord {
        let mut body = stored.body.clone();
        body.insert("id".into(), Value::String(id.to_string()));
        NativeRecord {
            id: id.to_string(),
            kind: stored.kind,
            revision: Revision::new(stored.revision.to_string()),
            changed_at: stored.changed_at,
            body,
        }
    }

    /// Adds a record as if someone created it on the platform.
    pub fn seed(&self, kind: EntityKind, body: Value) -> String {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let id = format!("{}-{}", self.platform.as_str(), state.clock);
        let stored = Stored {
            kind,
            revision: state.clock,
            changed_at: self.epoch + Duration::seconds(state.clock as i64),
            body: to_map(body),
        };
        state.records.insert(id.clone(), stored);
        id
    }

    /// Merges `patch` into a record as an out-of-band edit at `changed_at`.
    pub fn edit_at(&self, id: &str, patch: Value, changed_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let clock = state.clock;
        let stored = state.records.get_mut(id).expect("no such record");
        stored.body.extend(to_map(patch));
        stored.revision = clock;
        stored.changed_at = changed_at;
    }

    pub fn edit(&self, id: &str, patch: Value) {
        let at = {
            let state = self.state.lock().unwrap();
            self.epoch + Duration::seconds(state.clock as i64 + 1)
        };
        self.edit_at(id, patch, at);
    }

    /// The next write calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    /// Every later write signals `entered` and waits for `release`.
    pub fn hold_writes(&self) -> Arc<WriteGate> {
        let gate = Arc::new(WriteGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    /// Writes that changed a record.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Every create/update call, failed or replayed ones included.
    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn body(&self, id: &str) -> Option<JsonMap> {
        self.state.lock().unwrap().records.get(id).map(|s| s.body.clone())
    }

    pub fn ids(&self, kind: EntityKind) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn write(
        &self,
        kind: EntityKind,
        native_id: Option<&str>,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;

        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(reply) = state.replies.get(key.as_str()) {
            return Ok(reply.clone());
        }

        state.clock += 1;
        let clock = state.clock;
        let changed_at = self.epoch + Duration::seconds(clock as i64);

        let id = match native_id {
            Some(id) => {
                let stored = state.records.get_mut(id).ok_or_else(|| ApiError::Status {
                    status: 404,
                    message: format!("{id} not found"),
                    retry_after: None,
                })?;
                stored.body.extend(body.clone());
                stored.revision = clock;
                stored.changed_at = changed_at;
                id.to_string()
            }
            None => {
                let id = format!("{}-{}", self.platform.as_str(), clock);
                state.records.insert(
                    id.clone(),
                    Stored {
                        kind,
                        revision: clock,
                        changed_at,
                        body: body.clone(),
                    },
                );
                id
            }
        };

        state.writes += 1;
        let reply = Self::record(&id, &state.records[&id]);
        state.replies.insert(key.as_str().to_string(), reply.clone());
        Ok(reply)
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn list(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage, ApiError> {
        let after: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let state = self.state.lock().unwrap();

        let mut matching: Vec<(&String, &Stored)> = state
            .records
            .iter()
            .filter(|(_, s)| s.kind == kind && s.revision > after)
            .collect();
        matching.sort_by_key(|(_, s)| s.revision);

        let has_more = matching.len() > limit as usize;
        let records: Vec<NativeRecord> = matching
            .into_iter()
            .take(limit as usize)
            .map(|(id, s)| Self::record(id, s))
            .collect();

        let next_cursor = records
            .last()
            .map(|r| r.revision.as_str().to_string())
            .or_else(|| cursor.map(str::to_string));

        Ok(RecordPage {
            records,
            next_cursor,
            has_more,
            skipped: 0,
        })
    }

    async fn get(&self, _kind: EntityKind, native_id: &str) -> Result<Option<NativeRecord>, ApiError> {
        let state = self.state.lock().unwrap();
        Ok(state.records.get(native_id).map(|s| Self::record(native_id, s)))
    }

    async fn create(
        &self,
        kind: EntityKind,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        self.pass_gate().await;
        self.write(kind, None, body, key)
    }

    async fn update(
        &self,
        kind: EntityKind,
        native_id: &str,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        self.pass_gate().await;
        self.write(kind, Some(native_id), body, key)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const STOREFRONT_SECRET: &[u8] = b"storefront-secret";
pub const WAREHOUSE_SECRET: &[u8] = b"warehouse-secret";

/// Both platforms faked, wired the way the agent wires real ones.
pub struct Harness {
    pub db: Database,
    pub storefront: Arc<FakePlatform>,
    pub warehouse: Arc<FakePlatform>,
    pub engine: SyncEngine,
    pub scheduler: Scheduler,
}

impl Harness {
    pub async fn new(priority: Platform) -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let storefront = Arc::new(FakePlatform::new(Platform::Storefront));
        let warehouse = Arc::new(FakePlatform::new(Platform::Warehouse));
        let mapper = Arc::new(Mapper::new());
        let locks = Arc::new(KeyedLocks::new());

        let sources: Vec<Arc<dyn ChangeSource>> = vec![
            Arc::new(StorefrontSource::new(storefront.clone(), STOREFRONT_SECRET.to_vec(), 50)),
            Arc::new(WarehouseSource::new(warehouse.clone(), WAREHOUSE_SECRET.to_vec(), 50)),
        ];
        let engine = SyncEngine::new(
            db.clone(),
            mapper.clone(),
            ConflictPolicy { priority },
            sources,
            locks.clone(),
        );

        let executor = |api: Arc<FakePlatform>| {
            Executor::new(api, mapper.clone(), Arc::new(TokenBucket::new(100, 100.0)), db.clone())
        };
        let policy = RetryPolicy {
            base_delay: std::time::Duration::from_millis(10),
            max_delay: std::time::Duration::from_secs(1),
            max_attempts: 5,
            jitter: 0.0,
        };
        let scheduler = Scheduler::new(
            db.clone(),
            vec![(executor(storefront.clone()), 2), (executor(warehouse.clone()), 2)],
            policy,
            locks,
        );

        Harness {
            db,
            storefront,
            warehouse,
            engine,
            scheduler,
        }
    }
}
