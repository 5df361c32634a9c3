//! # Domain Types
//!
//! Core domain types shared by every layer of the bridge.
//!
//! ## Entity Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Canonical Model vs Platforms                         │
//! │                                                                         │
//! │   Storefront (A)              Canonical               Warehouse (B)     │
//! │   ──────────────              ─────────               ─────────────     │
//! │   gid://shop/Product/7 ◄──┐                      ┌──► 5f0c…-uuid        │
//! │                           │  ┌────────────────┐  │                      │
//! │           PlatformBinding ├──│CanonicalEntity │──┤ PlatformBinding      │
//! │    (revision, hash) ──────┘  │ id (UUID v4)   │  └───── (revision, hash)│
//! │                              │ kind           │                         │
//! │                              │ fields (sorted)│                         │
//! │                              │ content_hash   │                         │
//! │                              └────────────────┘                         │
//! │                                                                         │
//! │   ChangeEvent ──► Mapper ──► CanonicalEntity ──► Resolver               │
//! │                                                   │                     │
//! │                                                   ▼                     │
//! │                                             SyncOperation ──► Executor  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

/// JSON object as received from (or sent to) a platform API.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Canonical attribute map. A `BTreeMap` keeps key order stable for hashing.
pub type Fields = BTreeMap<String, FieldValue>;

// =============================================================================
// Platform
// =============================================================================

/// One of the two systems of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Platform A: the e-commerce storefront.
    Storefront,
    /// Platform B: the warehouse / inventory system.
    Warehouse,
}

impl Platform {
    /// Both platforms, in resolution order.
    pub const ALL: [Platform; 2] = [Platform::Storefront, Platform::Warehouse];

    /// Returns the opposite platform.
    pub const fn other(self) -> Platform {
        match self {
            Platform::Storefront => Platform::Warehouse,
            Platform::Warehouse => Platform::Storefront,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Platform::Storefront => "storefront",
            Platform::Warehouse => "warehouse",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "storefront" | "a" => Ok(Platform::Storefront),
            "warehouse" | "b" => Ok(Platform::Warehouse),
            other => Err(CoreError::UnknownPlatform(other.to_string())),
        }
    }
}

// =============================================================================
// Entity Kind
// =============================================================================

/// The kinds of records kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Variant,
    InventoryLevel,
    Order,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Product,
        EntityKind::Variant,
        EntityKind::InventoryLevel,
        EntityKind::Order,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Variant => "variant",
            EntityKind::InventoryLevel => "inventory_level",
            EntityKind::Order => "order",
        }
    }

    /// Canonical field used to pair records that already exist on both
    /// platforms before any binding was recorded.
    ///
    /// ## Natural Keys
    /// ```text
    /// Product         → handle        (storefront handle == warehouse code)
    /// Variant         → sku           (storefront sku    == warehouse article)
    /// InventoryLevel  → sku
    /// Order           → order_number
    /// ```
    pub const fn natural_key_field(&self) -> &'static str {
        match self {
            EntityKind::Product => "handle",
            EntityKind::Variant | EntityKind::InventoryLevel => "sku",
            EntityKind::Order => "order_number",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "product" | "products" => Ok(EntityKind::Product),
            "variant" | "variants" => Ok(EntityKind::Variant),
            "inventory_level" | "inventory_levels" | "stock" => Ok(EntityKind::InventoryLevel),
            "order" | "orders" | "customerorder" => Ok(EntityKind::Order),
            other => Err(CoreError::UnknownEntityKind(other.to_string())),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Opaque internal identifier of a canonical entity.
///
/// Allocated once by the reconciliation store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(Uuid);

impl CanonicalId {
    /// Allocates a fresh identifier.
    pub fn new() -> Self {
        CanonicalId(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        CanonicalId(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CanonicalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CanonicalId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(CanonicalId)
            .map_err(|e| CoreError::InvalidIdentifier(format!("{s}: {e}")))
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// A typed canonical attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Money(Money),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_money(&self) -> Option<Money> {
        match self {
            FieldValue::Money(m) => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Money(m) => write!(f, "{m}"),
        }
    }
}

// =============================================================================
// Content Hash
// =============================================================================

/// Hex-encoded SHA-256 digest of a canonical field map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes the canonical JSON encoding of `fields`.
    ///
    /// ## Determinism
    /// ```text
    /// BTreeMap (sorted keys) ──► serde_json bytes ──► SHA-256 ──► hex
    /// ```
    /// Insertion order never influences the digest.
    pub fn of(fields: &Fields) -> Self {
        // Serializing a BTreeMap of plain enums into a Vec cannot fail.
        let encoded = serde_json::to_vec(fields).unwrap_or_default();
        ContentHash(hex::encode(Sha256::digest(&encoded)))
    }

    /// Wraps a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        ContentHash(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

// =============================================================================
// Canonical Entity
// =============================================================================

/// Platform-agnostic representation of a product, variant, stock level or order.
///
/// ## Invariants
/// - `content_hash` always equals `ContentHash::of(&fields)`; there is no
///   setter for either, so the two cannot drift apart.
/// - Once an id is bound it cannot be replaced by a different one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EntityRecord", into = "EntityRecord")]
pub struct CanonicalEntity {
    id: Option<CanonicalId>,
    kind: EntityKind,
    fields: Fields,
    content_hash: ContentHash,
}

#[derive(Clone, Serialize, Deserialize)]
struct EntityRecord {
    id: Option<CanonicalId>,
    kind: EntityKind,
    fields: Fields,
}

impl From<EntityRecord> for CanonicalEntity {
    fn from(record: EntityRecord) -> Self {
        let mut entity = CanonicalEntity::new(record.kind, record.fields);
        entity.id = record.id;
        entity
    }
}

impl From<CanonicalEntity> for EntityRecord {
    fn from(entity: CanonicalEntity) -> Self {
        EntityRecord {
            id: entity.id,
            kind: entity.kind,
            fields: entity.fields,
        }
    }
}

impl CanonicalEntity {
    /// Creates an entity that has not yet been bound to an identity.
    pub fn new(kind: EntityKind, fields: Fields) -> Self {
        let content_hash = ContentHash::of(&fields);
        CanonicalEntity {
            id: None,
            kind,
            fields,
            content_hash,
        }
    }

    /// Creates an entity already bound to `id`.
    pub fn with_id(id: CanonicalId, kind: EntityKind, fields: Fields) -> Self {
        let mut entity = CanonicalEntity::new(kind, fields);
        entity.id = Some(id);
        entity
    }

    /// Binds the entity to its canonical identity.
    ///
    /// Re-binding to the same id is a no-op; binding to a different id fails.
    pub fn bind(mut self, id: CanonicalId) -> CoreResult<Self> {
        match self.id {
            Some(existing) if existing != id => Err(CoreError::IdentityAlreadyAssigned {
                existing: existing.to_string(),
                requested: id.to_string(),
            }),
            _ => {
                self.id = Some(id);
                Ok(self)
            }
        }
    }

    pub fn id(&self) -> Option<CanonicalId> {
        self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    /// Value of the kind's natural key, when it is a text field.
    pub fn natural_key(&self) -> Option<&str> {
        self.get(self.kind.natural_key_field())
            .and_then(FieldValue::as_text)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Per-platform, monotonically comparable revision marker.
///
/// Two numeric tokens compare numerically (`"9" < "10"`); anything else
/// compares lexicographically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Revision(token.into())
    }

    /// Revision from a native modification time, in epoch microseconds.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Revision(at.timestamp_micros().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Revision {}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<i128>(), other.0.parse::<i128>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Native Payload
// =============================================================================

/// Raw native representation, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum NativePayload {
    Product(JsonMap),
    Variant(JsonMap),
    InventoryLevel(JsonMap),
    Order(JsonMap),
}

impl NativePayload {
    pub fn new(kind: EntityKind, body: JsonMap) -> Self {
        match kind {
            EntityKind::Product => NativePayload::Product(body),
            EntityKind::Variant => NativePayload::Variant(body),
            EntityKind::InventoryLevel => NativePayload::InventoryLevel(body),
            EntityKind::Order => NativePayload::Order(body),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            NativePayload::Product(_) => EntityKind::Product,
            NativePayload::Variant(_) => EntityKind::Variant,
            NativePayload::InventoryLevel(_) => EntityKind::InventoryLevel,
            NativePayload::Order(_) => EntityKind::Order,
        }
    }

    pub fn body(&self) -> &JsonMap {
        match self {
            NativePayload::Product(body)
            | NativePayload::Variant(body)
            | NativePayload::InventoryLevel(body)
            | NativePayload::Order(body) => body,
        }
    }

    pub fn into_body(self) -> JsonMap {
        match self {
            NativePayload::Product(body)
            | NativePayload::Variant(body)
            | NativePayload::InventoryLevel(body)
            | NativePayload::Order(body) => body,
        }
    }
}

// =============================================================================
// Change Event
// =============================================================================

/// A single observed change on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub platform: Platform,
    pub native_id: String,
    pub kind: EntityKind,
    pub revision: Revision,
    pub payload: NativePayload,
    /// Native modification time; drives last-writer-wins.
    pub changed_at: DateTime<Utc>,
    /// When the bridge received the event.
    pub observed_at: DateTime<Utc>,
}

// =============================================================================
// Binding
// =============================================================================

/// Association between a canonical entity and its record on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformBinding {
    pub canonical_id: CanonicalId,
    pub platform: Platform,
    pub native_id: String,
    pub last_synced_revision: Revision,
    pub last_synced_hash: ContentHash,
    /// Number of successful swaps applied to this binding.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Operation
// =============================================================================

/// A change to push to one platform.
///
/// `based_on_hash` is the target binding's last synced hash at resolve time;
/// `None` when the target has no record yet and the operation creates one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub canonical_id: CanonicalId,
    pub target: Platform,
    pub desired: CanonicalEntity,
    pub based_on_hash: Option<ContentHash>,
}

impl SyncOperation {
    pub fn kind(&self) -> EntityKind {
        self.desired.kind()
    }

    /// Token sent to the target platform so a repeated call is a no-op.
    pub fn idempotency_token(&self) -> IdempotencyToken {
        IdempotencyToken::derive(self.canonical_id, self.target, self.based_on_hash.as_ref())
    }
}

/// Deterministic idempotency key.
///
/// ## Derivation
/// ```text
/// sha256("{canonical_id}:{target}:{based_on_hash | none}") → hex
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn derive(id: CanonicalId, target: Platform, based_on: Option<&ContentHash>) -> Self {
        let based_on = based_on.map(ContentHash::as_str).unwrap_or("none");
        let composite = format!("{id}:{target}:{based_on}");
        IdempotencyToken(hex::encode(Sha256::digest(composite.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Dead Letters & Audit
// =============================================================================

/// An operation held for operator intervention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub operation: SyncOperation,
    pub failure_reason: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Which precedence rule settled a field conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    LastWriterWins,
    PlatformPriority,
}

impl ResolutionRule {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResolutionRule::LastWriterWins => "last_writer_wins",
            ResolutionRule::PlatformPriority => "platform_priority",
        }
    }
}

/// Record of a value that lost a field-level conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditNote {
    pub canonical_id: CanonicalId,
    pub field: String,
    pub rule: ResolutionRule,
    pub winner: Platform,
    pub kept: Option<FieldValue>,
    pub discarded: Option<FieldValue>,
}

// =============================================================================
// Unit Tests
// =============================================================================
