//! # Conflict Resolver
//!
//! Decides the converged state of one canonical entity from its last synced
//! baseline and whatever each platform currently reports.
//!
//! ## Field-by-Field Three-Way Merge
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for every field in baseline ∪ storefront ∪ warehouse:                  │
//! │                                                                         │
//! │   storefront == warehouse            → take it (converged)              │
//! │   storefront == baseline             → take warehouse (one-sided)       │
//! │   warehouse  == baseline             → take storefront (one-sided)      │
//! │   both changed, different values:                                       │
//! │       inventory quantity             → later changed_at wins            │
//! │       anything else                  → priority platform wins           │
//! │       (loser recorded as an AuditNote)                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A side with no fresh observation is taken to still hold the baseline.
//!
//! After merging, every platform whose known hash differs from the merged
//! hash receives a [`SyncOperation`]. A platform that already holds the
//! merged state and reported a newer revision is *acknowledged*: its binding
//! can advance without an API call.
//!
//! `resolve` performs no I/O and reads no clock; equal inputs always give
//! equal outputs.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::types::{
    AuditNote, CanonicalEntity, CanonicalId, ContentHash, EntityKind, Fields, Platform,
    PlatformBinding, ResolutionRule, Revision, SyncOperation,
};

// =============================================================================
// Policy
// =============================================================================

/// Precedence configuration. There is deliberately no `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Platform whose value wins descriptive-field conflicts and LWW ties.
    pub priority: Platform,
}

/// How a field behaves under concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Stock counts: last writer wins by native modification time.
    Quantity,
    /// Identity and descriptive data: configured platform priority.
    Descriptive,
}

impl FieldClass {
    pub fn of(kind: EntityKind, field: &str) -> FieldClass {
        match (kind, field) {
            (EntityKind::InventoryLevel, "quantity") => FieldClass::Quantity,
            _ => FieldClass::Descriptive,
        }
    }
}

// =============================================================================
// Input / Output
// =============================================================================

/// Fresh state reported by one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub native_id: String,
    pub entity: CanonicalEntity,
    pub revision: Revision,
    pub changed_at: DateTime<Utc>,
}

/// What is known about one platform for this entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideState {
    pub binding: Option<PlatformBinding>,
    pub observation: Option<Observation>,
}

impl SideState {
    /// Hash the platform is believed to hold right now.
    fn known_hash(&self) -> Option<&ContentHash> {
        self.observation
            .as_ref()
            .map(|o| o.entity.content_hash())
            .or_else(|| self.binding.as_ref().map(|b| &b.last_synced_hash))
    }
}

/// Two-sided state of one canonical entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionInput {
    pub canonical_id: CanonicalId,
    pub kind: EntityKind,
    /// Last converged fields, `None` for an entity never synced before.
    pub baseline: Option<Fields>,
    pub storefront: SideState,
    pub warehouse: SideState,
}

impl ResolutionInput {
    pub fn side(&self, platform: Platform) -> &SideState {
        match platform {
            Platform::Storefront => &self.storefront,
            Platform::Warehouse => &self.warehouse,
        }
    }
}

/// A binding that can advance without an API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub platform: Platform,
    pub native_id: String,
    pub revision: Revision,
    /// Binding hash the swap expects to replace.
    pub expected_hash: Option<ContentHash>,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub merged: CanonicalEntity,
    pub operations: Vec<SyncOperation>,
    pub audit: Vec<AuditNote>,
    pub acknowledgements: Vec<Acknowledgement>,
}

impl Resolution {
    /// True when both platforms already hold the merged state.
    pub fn is_converged(&self) -> bool {
        self.operations.is_empty()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves one entity. Pure.
pub fn resolve(input: &ResolutionInput, policy: &ConflictPolicy) -> Resolution {
    let empty = Fields::new();
    let baseline = input.baseline.as_ref().unwrap_or(&empty);
    let storefront = current_fields(&input.storefront, baseline);
    let warehouse = current_fields(&input.warehouse, baseline);

    let names: BTreeSet<&String> = baseline
        .keys()
        .chain(storefront.keys())
        .chain(warehouse.keys())
        .collect();

    let mut merged = Fields::new();
    let mut audit = Vec::new();

    for name in names {
        let base = baseline.get(name);
        let a = storefront.get(name);
        let b = warehouse.get(name);

        let chosen = if a == b || b == base {
            a
        } else if a == base {
            b
        } else {
            let (rule, winner) = settle(input, policy, name);
            let (kept, discarded) = match winner {
                Platform::Storefront => (a, b),
                Platform::Warehouse => (b, a),
            };
            audit.push(AuditNote {
                canonical_id: input.canonical_id,
                field: name.clone(),
                rule,
                winner,
                kept: kept.cloned(),
                discarded: discarded.cloned(),
            });
            kept
        };

        if let Some(value) = chosen {
            merged.insert(name.clone(), value.clone());
        }
    }

    let merged = CanonicalEntity::with_id(input.canonical_id, input.kind, merged);
    let merged_hash = merged.content_hash().clone();

    let mut operations = Vec::new();
    let mut acknowledgements = Vec::new();

    for platform in Platform::ALL {
        let side = input.side(platform);
        let binding_hash = side.binding.as_ref().map(|b| b.last_synced_hash.clone());

        if side.known_hash() != Some(&merged_hash) {
            operations.push(SyncOperation {
                canonical_id: input.canonical_id,
                target: platform,
                desired: merged.clone(),
                based_on_hash: binding_hash,
            });
            continue;
        }

        if let Some(obs) = &side.observation {
            let advanced = side
                .binding
                .as_ref()
                .map_or(true, |b| obs.revision > b.last_synced_revision || b.last_synced_hash != merged_hash);
            if advanced {
                acknowledgements.push(Acknowledgement {
                    platform,
                    native_id: obs.native_id.clone(),
                    revision: obs.revision.clone(),
                    expected_hash: binding_hash,
                });
            }
        }
    }

    Resolution {
        merged,
        operations,
        audit,
        acknowledgements,
    }
}

/// Observed fields, or the baseline when the side reported nothing new.
fn current_fields<'a>(side: &'a SideState, baseline: &'a Fields) -> &'a Fields {
    side.observation
        .as_ref()
        .map(|o| o.entity.fields())
        .unwrap_or(baseline)
}

/// Picks the winner of a true field conflict.
fn settle(input: &ResolutionInput, policy: &ConflictPolicy, field: &str) -> (ResolutionRule, Platform) {
    match FieldClass::of(input.kind, field) {
        FieldClass::Descriptive => (ResolutionRule::PlatformPriority, policy.priority),
        FieldClass::Quantity => {
            let changed_at = |p: Platform| input.side(p).observation.as_ref().map(|o| o.changed_at);
            let winner = match (changed_at(Platform::Storefront), changed_at(Platform::Warehouse)) {
                (Some(a), Some(b)) if a > b => Platform::Storefront,
                (Some(a), Some(b)) if b > a => Platform::Warehouse,
                _ => policy.priority,
            };
            (ResolutionRule::LastWriterWins, winner)
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
