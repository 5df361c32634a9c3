//! # Sync Engine
//!
//! Turns observed changes into bindings, audit notes and queued operations.
//!
//! ## Reconciliation Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  poll (both platforms, per kind) ─┐                                     │
//! │  webhook inbox ───────────────────┼──► ChangeEvent batch                │
//! │  refresh requests ────────────────┘          │                          │
//! │                                              ▼                          │
//! │  1. map      Mapper::to_canonical      MappingError → skip + count     │
//! │  2. identify binding by native id  ▸  unbound entity with same natural │
//! │              key  ▸  register a new canonical id                       │
//! │  3. group    newest revision per (entity, platform)                    │
//! │                                              │                          │
//! │  per entity, under its lock:                 ▼                          │
//! │  4. load     baseline + bindings; drop observations older than the     │
//! │              binding's revision                                         │
//! │  5. resolve  three-way merge (pure)                                     │
//! │  6. ack      CAS bindings that already hold the merged state           │
//! │              conflict → reload and resolve again (bounded)             │
//! │  7. record   audit notes, enqueue one operation per lagging platform   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cursors are saved only after the events they cover are reconciled, so a
//! crash replays pages instead of skipping them.

use chrono::Utc;
use futures_util::TryStreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use stockbridge_core::{
    resolve, CanonicalId, ChangeEvent, ConflictPolicy, EntityKind, Mapper, Observation, Platform,
    PlatformBinding, ResolutionInput, SideState,
};
use stockbridge_db::{BindingUpdate, CasOutcome, Database, DbError, KeyedLocks};

use crate::error::{SyncError, SyncResult};
use crate::source::{ChangeFeed, ChangeSource};

const DEFAULT_CONFLICT_RETRIES: u32 = 3;

// =============================================================================
// Report
// =============================================================================

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub events_seen: usize,
    pub mapping_errors: usize,
    /// Listing rows a platform returned that could not be parsed.
    pub malformed_rows: usize,
    pub stale_skipped: usize,
    pub entities_reconciled: usize,
    pub operations_enqueued: usize,
    pub acknowledgements: usize,
    pub audit_notes: usize,
    pub conflicts_retried: usize,
    /// Platform/kind polls that failed and will be retried next pass.
    pub poll_failures: usize,
}

impl RunReport {
    pub fn merge(&mut self, other: RunReport) {
        self.events_seen += other.events_seen;
        self.mapping_errors += other.mapping_errors;
        self.malformed_rows += other.malformed_rows;
        self.stale_skipped += other.stale_skipped;
        self.entities_reconciled += other.entities_reconciled;
        self.operations_enqueued += other.operations_enqueued;
        self.acknowledgements += other.acknowledgements;
        self.audit_notes += other.audit_notes;
        self.conflicts_retried += other.conflicts_retried;
        self.poll_failures += other.poll_failures;
    }

    pub fn is_idle(&self) -> bool {
        self.events_seen == 0 && self.poll_failures == 0 && self.malformed_rows == 0
    }
}

/// Newest observation per platform for one entity.
#[derive(Debug, Default)]
struct Observed {
    storefront: Option<Observation>,
    warehouse: Option<Observation>,
}

impl Observed {
    fn slot(&mut self, platform: Platform) -> &mut Option<Observation> {
        match platform {
            Platform::Storefront => &mut self.storefront,
            Platform::Warehouse => &mut self.warehouse,
        }
    }

    fn offer(&mut self, platform: Platform, observation: Observation) {
        let slot = self.slot(platform);
        if slot.as_ref().map_or(true, |o| o.revision <= observation.revision) {
            *slot = Some(observation);
        }
    }
}

/// Per-batch identity cache.
#[derive(Default)]
struct Identities {
    by_native: HashMap<(Platform, String), CanonicalId>,
    claimed: HashSet<(CanonicalId, Platform)>,
}

// =============================================================================
// Engine
// =============================================================================

/// Reconciles both platforms into the store.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    mapper: Arc<Mapper>,
    policy: ConflictPolicy,
    sources: HashMap<Platform, Arc<dyn ChangeSource>>,

    /// Shared with the scheduler so deliveries and reconciliation of one
    /// entity never interleave. Passing the store's own CAS lock set here
    /// would deadlock: `compare_and_swap` takes it while this is held.
    locks: Arc<KeyedLocks<CanonicalId>>,

    max_conflict_retries: u32,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        mapper: Arc<Mapper>,
        policy: ConflictPolicy,
        sources: Vec<Arc<dyn ChangeSource>>,
        locks: Arc<KeyedLocks<CanonicalId>>,
    ) -> Self {
        SyncEngine {
            db,
            mapper,
            policy,
            sources: sources.into_iter().map(|s| (s.platform(), s)).collect(),
            locks,
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn source(&self, platform: Platform) -> Option<&Arc<dyn ChangeSource>> {
        self.sources.get(&platform)
    }

    /// Sources keyed by platform, for the webhook endpoint.
    pub fn sources(&self) -> &HashMap<Platform, Arc<dyn ChangeSource>> {
        &self.sources
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Polls every platform for `kinds`, then drains the webhook inbox.
    pub async fn run_once(&self, kinds: &[EntityKind], inbox_batch: u32) -> SyncResult<RunReport> {
        let mut report = RunReport::default();

        for &kind in kinds {
            report.merge(self.poll_kind(kind).await?);
        }
        report.merge(self.drain_inbox(inbox_batch).await?);

        if !report.is_idle() {
            info!(?report, "Reconciliation pass complete");
        }
        Ok(report)
    }

    /// Polls one kind on every platform and reconciles the changes together.
    ///
    /// Events from both sides are merged before resolving so an entity that
    /// already matches on both platforms is bound without any write.
    pub async fn poll_kind(&self, kind: EntityKind) -> SyncResult<RunReport> {
        let mut report = RunReport::default();
        let mut events = Vec::new();
        let mut checkpoints = Vec::new();

        for platform in Platform::ALL {
            let Some(source) = self.sources.get(&platform) else {
                continue;
            };
            let since = self.db.cursors().get(platform, kind).await?;

            let pages: Vec<_> = match ChangeFeed::pages(source.clone(), kind, since).try_collect().await {
                Ok(pages) => pages,
                Err(e) => {
                    warn!(platform = %platform, kind = %kind, error = %e, "Poll failed");
                    report.poll_failures += 1;
                    continue;
                }
            };

            for page in pages {
                report.malformed_rows += page.skipped;
                events.extend(page.events);
                if let Some(cursor) = page.next_cursor {
                    checkpoints.push((platform, cursor));
                }
            }
        }

        report.merge(self.reconcile_events(events).await?);

        // Only the last checkpoint per platform matters
        for (platform, cursor) in checkpoints {
            self.db.cursors().save(platform, kind, &cursor).await?;
        }
        Ok(report)
    }

    /// Reconciles accepted webhook events, oldest first.
    pub async fn drain_inbox(&self, batch: u32) -> SyncResult<RunReport> {
        let mut report = RunReport::default();
        let batch = batch.max(1);

        loop {
            let entries = self.db.inbox().peek(batch).await?;
            if entries.is_empty() {
                break;
            }
            let full = entries.len() as u32 == batch;
            let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();

            report.merge(
                self.reconcile_events(entries.into_iter().map(|e| e.event).collect())
                    .await?,
            );
            self.db.inbox().remove(&ids).await?;

            if !full {
                break;
            }
        }
        Ok(report)
    }

    /// Re-reads every bound record of `id` and reconciles what comes back.
    pub async fn refresh(&self, id: CanonicalId) -> SyncResult<RunReport> {
        let record = self
            .db
            .entities()
            .get(id)
            .await?
            .ok_or_else(|| DbError::not_found("canonical_entity", id.to_string()))?;

        let mut events = Vec::new();
        for binding in self.db.bindings().for_entity(id).await? {
            let Some(source) = self.sources.get(&binding.platform) else {
                continue;
            };
            if let Some(event) = source.fetch_current(record.kind, &binding.native_id).await? {
                events.push(event);
            }
        }

        debug!(canonical_id = %id, events = events.len(), "Refreshing entity");
        self.reconcile_events(events).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Maps, identifies and reconciles a batch of events.
    pub async fn reconcile_events(&self, events: Vec<ChangeEvent>) -> SyncResult<RunReport> {
        let mut report = RunReport {
            events_seen: events.len(),
            ..Default::default()
        };
        let mut identities = Identities::default();
        let mut grouped: BTreeMap<CanonicalId, (EntityKind, Observed)> = BTreeMap::new();

        for event in events {
            let entity = match self.mapper.to_canonical(event.platform, &event.payload) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(
                        platform = %event.platform,
                        kind = %event.kind,
                        native_id = %event.native_id,
                        field = e.field(),
                        error = %e,
                        "Skipping unmappable record"
                    );
                    report.mapping_errors += 1;
                    continue;
                }
            };

            let id = self.identify(&event, entity.natural_key(), &mut identities).await?;
            let observation = Observation {
                native_id: event.native_id,
                entity: entity.bind(id)?,
                revision: event.revision,
                changed_at: event.changed_at,
            };

            grouped
                .entry(id)
                .or_insert_with(|| (event.kind, Observed::default()))
                .1
                .offer(event.platform, observation);
        }

        for (id, (kind, observed)) in grouped {
            report.merge(self.reconcile_entity(id, kind, observed).await?);
        }
        Ok(report)
    }

    async fn identify(
        &self,
        event: &ChangeEvent,
        natural_key: Option<&str>,
        identities: &mut Identities,
    ) -> SyncResult<CanonicalId> {
        let native = (event.platform, event.native_id.clone());
        if let Some(id) = identities.by_native.get(&native) {
            return Ok(*id);
        }

        let id = match self.db.bindings().find_by_native(event.platform, &event.native_id).await? {
            Some(binding) => binding.canonical_id,
            None => {
                let matched = match natural_key {
                    Some(key) => self
                        .db
                        .entities()
                        .find_unbound_by_natural_key(event.kind, key, event.platform)
                        .await?
                        .filter(|id| !identities.claimed.contains(&(*id, event.platform))),
                    None => None,
                };
                match matched {
                    Some(id) => id,
                    None => self.db.entities().register(event.kind, natural_key).await?,
                }
            }
        };

        identities.by_native.insert(native, id);
        identities.claimed.insert((id, event.platform));
        Ok(id)
    }

    async fn reconcile_entity(
        &self,
        id: CanonicalId,
        kind: EntityKind,
        mut observed: Observed,
    ) -> SyncResult<RunReport> {
        let _guard = self.locks.lock(&id).await;
        let mut report = RunReport::default();

        for _ in 0..=self.max_conflict_retries {
            let record = self
                .db
                .entities()
                .get(id)
                .await?
                .ok_or_else(|| DbError::not_found("canonical_entity", id.to_string()))?;
            let bindings = self.db.bindings().for_entity(id).await?;

            let storefront = side(&bindings, Platform::Storefront, &mut observed, &mut report);
            let warehouse = side(&bindings, Platform::Warehouse, &mut observed, &mut report);

            let input = ResolutionInput {
                canonical_id: id,
                kind,
                baseline: record.baseline.map(|b| b.fields().clone()),
                storefront,
                warehouse,
            };
            let resolution = resolve(&input, &self.policy);

            let mut conflicted = false;
            for ack in &resolution.acknowledgements {
                let update = BindingUpdate {
                    native_id: ack.native_id.clone(),
                    revision: ack.revision.clone(),
                    entity: resolution.merged.clone(),
                };
                let outcome = self
                    .db
                    .bindings()
                    .compare_and_swap(id, ack.platform, ack.expected_hash.as_ref(), &update)
                    .await?;
                match outcome {
                    CasOutcome::Swapped(_) => report.acknowledgements += 1,
                    CasOutcome::Conflict { .. } => {
                        conflicted = true;
                        break;
                    }
                }
            }
            if conflicted {
                debug!(canonical_id = %id, "Binding moved during reconciliation, resolving again");
                report.conflicts_retried += 1;
                continue;
            }

            let now = Utc::now();
            if !resolution.audit.is_empty() {
                self.db.audit().record(&resolution.audit, now).await?;
                for note in &resolution.audit {
                    info!(
                        canonical_id = %id,
                        field = %note.field,
                        rule = note.rule.as_str(),
                        winner = %note.winner,
                        "Field conflict settled"
                    );
                }
            }
            for op in &resolution.operations {
                self.db.operations().enqueue(op, now).await?;
            }

            report.entities_reconciled += 1;
            report.audit_notes += resolution.audit.len();
            report.operations_enqueued += resolution.operations.len();
            return Ok(report);
        }

        Err(SyncError::Domain(format!(
            "entity {id} kept changing during reconciliation"
        )))
    }
}

/// Builds one side of the resolver input, dropping an observation older than
/// what the binding already recorded.
fn side(
    bindings: &[PlatformBinding],
    platform: Platform,
    observed: &mut Observed,
    report: &mut RunReport,
) -> SideState {
    let binding = bindings.iter().find(|b| b.platform == platform).cloned();
    let slot = observed.slot(platform);

    let stale = match (&binding, slot.as_ref()) {
        (Some(b), Some(o)) => o.revision < b.last_synced_revision,
        _ => false,
    };
    if stale {
        report.stale_skipped += 1;
        *slot = None;
    }

    SideState {
        binding,
        observation: slot.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PlatformApi;
    use crate::testing::Harness;
    use serde_json::json;
    use stockbridge_core::{FieldValue, Money, ResolutionRule};
    use stockbridge_db::OperationState;

    #[tokio::test]
    async fn test_matching_records_bind_without_writes() {
        let h = Harness::new(Platform::Storefront).await;
        h.storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "mug-01", "available": 8}));
        h.warehouse
            .seed(EntityKind::InventoryLevel, json!({"article": "MUG-01", "stock": 8}));

        let report = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(report.entities_reconciled, 1);
        assert_eq!(report.acknowledgements, 2);
        assert_eq!(report.operations_enqueued, 0);

        assert_eq!(h.db.entities().count().await.unwrap(), 1);
        assert_eq!(h.db.bindings().count().await.unwrap(), 2);
        assert_eq!(h.db.operations().count(OperationState::Pending).await.unwrap(), 0);
        assert_eq!(h.storefront.write_calls() + h.warehouse.write_calls(), 0);

        // Nothing new on the next pass
        let again = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(again.operations_enqueued, 0);
        assert_eq!(again.acknowledgements, 0);
    }

    #[tokio::test]
    async fn test_new_record_is_created_on_other_platform() {
        let h = Harness::new(Platform::Storefront).await;
        h.storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "CUP-02", "available": 3}));

        let report = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(report.operations_enqueued, 1);
        assert_eq!(report.acknowledgements, 1);

        let delivered = h.scheduler.process_due(Utc::now()).await.unwrap();
        assert_eq!(delivered.applied, 1);

        let ids = h.warehouse.ids(EntityKind::InventoryLevel);
        assert_eq!(ids.len(), 1);
        let body = h.warehouse.body(&ids[0]).unwrap();
        assert_eq!(body["article"], "CUP-02");
        assert_eq!(body["stock"], 3);

        // Seeing our own write come back changes nothing
        let echo = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(echo.operations_enqueued, 0);
        assert_eq!(h.warehouse.writes(), 1);
    }

    #[tokio::test]
    async fn test_price_conflict_follows_priority_and_is_audited() {
        let h = Harness::new(Platform::Storefront).await;
        let sf = h.storefront.seed(
            EntityKind::Variant,
            json!({"sku": "MUG-01", "price": "10.00", "title": "Mug"}),
        );
        let wh = h.warehouse.seed(
            EntityKind::Variant,
            json!({"article": "MUG-01", "salePrice": 1000, "name": "Mug"}),
        );
        h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();

        h.storefront.edit(&sf, json!({"price": "12.00"}));
        h.warehouse.edit(&wh, json!({"salePrice": 1100}));

        let report = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(report.audit_notes, 1);
        assert_eq!(report.operations_enqueued, 1);

        let id = h
            .db
            .bindings()
            .find_by_native(Platform::Storefront, &sf)
            .await
            .unwrap()
            .unwrap()
            .canonical_id;
        let audit = h.db.audit().for_entity(id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].note.field, "price");
        assert_eq!(audit[0].note.rule, ResolutionRule::PlatformPriority);
        assert_eq!(audit[0].note.winner, Platform::Storefront);
        assert_eq!(audit[0].note.discarded, Some(FieldValue::Money(Money::from_cents(1100))));

        h.scheduler.process_due(Utc::now()).await.unwrap();
        assert_eq!(h.warehouse.body(&wh).unwrap()["salePrice"], 1200);
        assert_eq!(h.storefront.writes(), 0);
    }

    #[tokio::test]
    async fn test_quantity_conflict_is_last_writer_wins() {
        let h = Harness::new(Platform::Storefront).await;
        let sf = h
            .storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "MUG-01", "available": 8}));
        let wh = h
            .warehouse
            .seed(EntityKind::InventoryLevel, json!({"article": "MUG-01", "stock": 8}));
        h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();

        let t = Utc::now();
        h.storefront.edit_at(&sf, json!({"available": 6}), t);
        h.warehouse
            .edit_at(&wh, json!({"stock": 5}), t + chrono::Duration::seconds(30));

        let report = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(report.audit_notes, 1);

        h.scheduler.process_due(Utc::now()).await.unwrap();
        assert_eq!(h.storefront.body(&sf).unwrap()["available"], 5);
    }

    #[tokio::test]
    async fn test_unmappable_record_is_skipped_and_counted() {
        let h = Harness::new(Platform::Storefront).await;
        h.storefront.seed(
            EntityKind::InventoryLevel,
            json!({"sku": "MUG-01", "available": 8, "colour": "red"}),
        );
        h.storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "CUP-02", "available": 1}));

        let report = h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();
        assert_eq!(report.mapping_errors, 1);
        assert_eq!(report.entities_reconciled, 1);
        assert_eq!(h.db.entities().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_event_is_ignored() {
        let h = Harness::new(Platform::Storefront).await;
        let sf = h
            .storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "MUG-01", "available": 8}));
        h.warehouse
            .seed(EntityKind::InventoryLevel, json!({"article": "MUG-01", "stock": 8}));
        h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();

        let current = h
            .storefront
            .get(EntityKind::InventoryLevel, &sf)
            .await
            .unwrap()
            .unwrap();
        let mut old = crate::source::record_to_event(Platform::Storefront, current);
        old.revision = stockbridge_core::Revision::new("0");
        old.payload = stockbridge_core::NativePayload::new(
            EntityKind::InventoryLevel,
            json!({"sku": "MUG-01", "available": 1}).as_object().cloned().unwrap(),
        );

        let report = h.engine.reconcile_events(vec![old]).await.unwrap();
        assert_eq!(report.stale_skipped, 1);
        assert_eq!(report.operations_enqueued, 0);
    }

    #[tokio::test]
    async fn test_refresh_rereads_bound_records() {
        let h = Harness::new(Platform::Warehouse).await;
        let sf = h
            .storefront
            .seed(EntityKind::InventoryLevel, json!({"sku": "MUG-01", "available": 8}));
        h.warehouse
            .seed(EntityKind::InventoryLevel, json!({"article": "MUG-01", "stock": 8}));
        h.engine.run_once(&EntityKind::ALL, 100).await.unwrap();

        let id = h
            .db
            .bindings()
            .find_by_native(Platform::Storefront, &sf)
            .await
            .unwrap()
            .unwrap()
            .canonical_id;
        h.storefront.edit(&sf, json!({"available": 4}));

        let report = h.engine.refresh(id).await.unwrap();
        assert_eq!(report.events_seen, 2);
        assert_eq!(report.operations_enqueued, 1);
        let ops = h.db.operations().for_entity(id).await.unwrap();
        assert_eq!(ops[0].operation.target, Platform::Warehouse);
        assert_eq!(ops[0].operation.desired.get("quantity"), Some(&FieldValue::Integer(4)));
    }

    #[tokio::test]
    async fn test_warehouse_edit_after_versionless_webhook_is_not_stale() {
        let h = Harness::new(Platform::Storefront).await;
        let source = h.engine.source(Platform::Warehouse).unwrap().clone();
        let deliver = |entity: serde_json::Value| {
            let bytes = serde_json::to_vec(&json!({"entityType": "stock", "entity": entity})).unwrap();
            let sig = crate::signature::sign_hex(crate::testing::WAREHOUSE_SECRET, &bytes);
            source
                .ingest(&crate::source::RawWebhook::new(bytes).with_header(crate::warehouse::SIGNATURE_HEADER, sig))
                .unwrap()
        };

        let first = deliver(json!({
            "id": "st-1", "article": "MUG-01", "stock": 5, "updated": "2026-03-01 10:00:00.000"
        }));
        h.engine.reconcile_events(vec![first]).await.unwrap();

        let second = deliver(json!({
            "id": "st-1", "article": "MUG-01", "stock": 9, "updated": "2026-03-01 11:00:00.000", "version": 7
        }));
        let report = h.engine.reconcile_events(vec![second]).await.unwrap();
        assert_eq!(report.stale_skipped, 0);
        assert_eq!(report.operations_enqueued, 1);

        let id = h
            .db
            .bindings()
            .find_by_native(Platform::Warehouse, "st-1")
            .await
            .unwrap()
            .unwrap()
            .canonical_id;
        let ops = h.db.operations().for_entity(id).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation.target, Platform::Storefront);
        assert_eq!(ops[0].operation.desired.get("quantity"), Some(&FieldValue::Integer(9)));
    }

    #[tokio::test]
    async fn test_malformed_listing_row_does_not_block_the_kind() {
        use crate::api::HttpClient;
        use crate::warehouse::{WarehouseApi, WarehouseSource};
        use stockbridge_db::DbConfig;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entity/stock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [
                    {"id": "s1", "article": "MUG-01", "stock": 4, "updated": "2026-03-01 10:00:00.000"},
                    {"id": "s2", "article": "CUP-02", "stock": 1}
                ]
            })))
            .mount(&server)
            .await;

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let http = HttpClient::new(&server.uri(), "t", std::time::Duration::from_secs(5)).unwrap();
        let source: Arc<dyn ChangeSource> = Arc::new(WarehouseSource::new(
            Arc::new(WarehouseApi::new(http)),
            b"secret".to_vec(),
            50,
        ));
        let engine = SyncEngine::new(
            db.clone(),
            Arc::new(Mapper::new()),
            ConflictPolicy {
                priority: Platform::Storefront,
            },
            vec![source],
            Arc::new(KeyedLocks::new()),
        );

        let report = engine.poll_kind(EntityKind::InventoryLevel).await.unwrap();
        assert_eq!(report.poll_failures, 0);
        assert_eq!(report.malformed_rows, 1);
        assert_eq!(report.entities_reconciled, 1);
        assert_eq!(report.operations_enqueued, 1);

        let cursor = db
            .cursors()
            .get(Platform::Warehouse, EntityKind::InventoryLevel)
            .await
            .unwrap();
        assert_eq!(cursor.as_deref(), Some("0:2026-03-01 10:00:00.000"));
    }
}
