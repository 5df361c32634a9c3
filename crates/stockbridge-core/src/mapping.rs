//! # Entity Mapper
//!
//! Translates native payloads to canonical entities and back, driven by an
//! explicit table per (platform, kind).
//!
//! ## Table Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Storefront / Variant                                                   │
//! │                                                                         │
//! │  native      canonical   native type     required   normalizer          │
//! │  ─────────   ─────────   ─────────────   ────────   ──────────          │
//! │  sku         sku         Text            yes        Sku                 │
//! │  price       price       DecimalMoney    yes        -                   │
//! │  title       title       Text            no         -                   │
//! │  barcode     barcode     Text            no         -                   │
//! │                                                                         │
//! │  ignored: id, productId, inventoryItemId, updatedAt, createdAt, ...     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any native key that is neither mapped nor ignored is an
//! [`MappingError::UnknownField`]: an attribute the bridge does not
//! understand cannot be carried losslessly, so the entity is excluded and
//! reported instead of being half-synced.
//!
//! Both directions are deterministic and allocation is the only side effect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{MappingError, MappingResult};
use crate::money::Money;
use crate::types::{CanonicalEntity, EntityKind, FieldValue, Fields, JsonMap, NativePayload, Platform};
use crate::validation::{normalize_currency, normalize_sku, validate_currency, validate_sku};

// =============================================================================
// Table Types
// =============================================================================

/// How a value is encoded on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    /// JSON string ↔ `FieldValue::Text`
    Text,
    /// JSON integer ↔ `FieldValue::Integer` (integral floats accepted on read)
    Integer,
    /// JSON decimal string `"19.99"` ↔ `FieldValue::Money`
    DecimalMoney,
    /// JSON integer minor units `1999` ↔ `FieldValue::Money`
    MinorUnits,
}

impl NativeType {
    const fn describe(&self) -> &'static str {
        match self {
            NativeType::Text => "a string",
            NativeType::Integer => "an integer",
            NativeType::DecimalMoney => "a decimal string with at most two fractional digits",
            NativeType::MinorUnits => "an integer amount in minor units",
        }
    }
}

/// Value clean-up applied on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Verbatim,
    Sku,
    Currency,
}

/// One row of a mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub canonical: &'static str,
    pub native: String,
    pub native_type: NativeType,
    pub required: bool,
    pub normalizer: Normalizer,
}

impl FieldRule {
    fn new(canonical: &'static str, native: &str, native_type: NativeType) -> Self {
        FieldRule {
            canonical,
            native: native.to_string(),
            native_type,
            required: false,
            normalizer: Normalizer::Verbatim,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn normalized(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }
}

/// Rename of a native column, supplied by configuration.
///
/// ## Example (TOML)
/// ```toml
/// [[warehouse.field_overrides]]
/// kind = "product"
/// canonical = "vendor"
/// native = "manufacturer"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOverride {
    pub kind: EntityKind,
    pub canonical: String,
    pub native: String,
}

// =============================================================================
// Mapping Table
// =============================================================================

/// Explicit attribute table for one (platform, kind).
#[derive(Debug, Clone)]
pub struct MappingTable {
    platform: Platform,
    kind: EntityKind,
    rules: Vec<FieldRule>,
    ignored: &'static [&'static str],
}

impl MappingTable {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Native column carrying a canonical field.
    pub fn native_name(&self, canonical: &str) -> Option<&str> {
        self.rule_for_canonical(canonical).map(|r| r.native.as_str())
    }

    fn rule_for_native(&self, native: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.native == native)
    }

    fn rule_for_canonical(&self, canonical: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.canonical == canonical)
    }

    fn unknown(&self, field: &str) -> MappingError {
        MappingError::UnknownField {
            platform: self.platform,
            kind: self.kind,
            field: field.to_string(),
        }
    }

    fn to_canonical(&self, body: &JsonMap) -> MappingResult<Fields> {
        let mut fields = Fields::new();

        for (key, value) in body {
            let Some(rule) = self.rule_for_native(key) else {
                if self.ignored.contains(&key.as_str()) {
                    continue;
                }
                return Err(self.unknown(key));
            };

            if value.is_null() {
                continue;
            }
            fields.insert(rule.canonical.to_string(), read_value(rule, value)?);
        }

        for rule in self.rules.iter().filter(|r| r.required) {
            if !fields.contains_key(rule.canonical) {
                return Err(MappingError::MissingRequiredField {
                    field: rule.native.clone(),
                });
            }
        }

        Ok(fields)
    }

    fn to_native(&self, fields: &Fields) -> MappingResult<JsonMap> {
        let mut body = JsonMap::new();

        for (name, value) in fields {
            let rule = self.rule_for_canonical(name).ok_or_else(|| self.unknown(name))?;
            body.insert(rule.native.clone(), write_value(rule, value)?);
        }

        for rule in self.rules.iter().filter(|r| r.required) {
            if !fields.contains_key(rule.canonical) {
                return Err(MappingError::MissingRequiredField {
                    field: rule.canonical.to_string(),
                });
            }
        }

        Ok(body)
    }
}

fn mismatch(rule: &FieldRule) -> MappingError {
    MappingError::TypeMismatch {
        field: rule.native.clone(),
        expected: rule.native_type.describe(),
    }
}

fn read_value(rule: &FieldRule, value: &Value) -> MappingResult<FieldValue> {
    match rule.native_type {
        NativeType::Text => {
            let text = value.as_str().ok_or_else(|| mismatch(rule))?;
            normalize(rule, text).map(FieldValue::Text)
        }
        NativeType::Integer => read_integer(value)
            .map(FieldValue::Integer)
            .ok_or_else(|| mismatch(rule)),
        NativeType::DecimalMoney => {
            let text = value.as_str().ok_or_else(|| mismatch(rule))?;
            Money::parse_decimal(text)
                .map(FieldValue::Money)
                .map_err(|_| mismatch(rule))
        }
        NativeType::MinorUnits => read_integer(value)
            .map(|cents| FieldValue::Money(Money::from_cents(cents)))
            .ok_or_else(|| mismatch(rule)),
    }
}

/// Integers, plus floats with no fractional part (`5.0`).
fn read_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn write_value(rule: &FieldRule, value: &FieldValue) -> MappingResult<Value> {
    match (rule.native_type, value) {
        (NativeType::Text, FieldValue::Text(s)) => Ok(Value::String(s.clone())),
        (NativeType::Integer, FieldValue::Integer(v)) => Ok(Value::from(*v)),
        (NativeType::DecimalMoney, FieldValue::Money(m)) => Ok(Value::String(m.to_decimal_string())),
        (NativeType::MinorUnits, FieldValue::Money(m)) => Ok(Value::from(m.cents())),
        _ => Err(mismatch(rule)),
    }
}

fn normalize(rule: &FieldRule, text: &str) -> MappingResult<String> {
    let invalid = |reason: String| MappingError::InvalidValue {
        field: rule.native.clone(),
        reason,
    };

    match rule.normalizer {
        Normalizer::Verbatim => Ok(text.to_string()),
        Normalizer::Sku => {
            let sku = normalize_sku(text);
            validate_sku(&sku).map_err(|e| invalid(e.to_string()))?;
            Ok(sku)
        }
        Normalizer::Currency => {
            let code = normalize_currency(text);
            validate_currency(&code).map_err(|e| invalid(e.to_string()))?;
            Ok(code)
        }
    }
}

// =============================================================================
// Default Tables
// =============================================================================

const STOREFRONT_IGNORED: &[&str] = &[
    "id",
    "legacyResourceId",
    "productId",
    "inventoryItemId",
    "locationId",
    "createdAt",
    "updatedAt",
    "publishedAt",
    "status",
    "tags",
    "images",
    "variants",
    "lineItems",
    "processedAt",
];

const WAREHOUSE_IGNORED: &[&str] = &[
    "id",
    "accountId",
    "meta",
    "href",
    "externalCode",
    "version",
    "updated",
    "created",
    "archived",
    "owner",
    "group",
    "shared",
    "productFolder",
    "positions",
    "moment",
];

fn default_rules(platform: Platform, kind: EntityKind) -> Vec<FieldRule> {
    use NativeType::*;

    match (platform, kind) {
        (Platform::Storefront, EntityKind::Product) => vec![
            FieldRule::new("title", "title", Text).required(),
            FieldRule::new("handle", "handle", Text).required(),
            FieldRule::new("description", "bodyHtml", Text),
            FieldRule::new("vendor", "vendor", Text),
            FieldRule::new("product_type", "productType", Text),
        ],
        (Platform::Warehouse, EntityKind::Product) => vec![
            FieldRule::new("title", "name", Text).required(),
            FieldRule::new("handle", "code", Text).required(),
            FieldRule::new("description", "description", Text),
            FieldRule::new("vendor", "supplier", Text),
            FieldRule::new("product_type", "pathName", Text),
        ],
        (Platform::Storefront, EntityKind::Variant) => vec![
            FieldRule::new("sku", "sku", Text).required().normalized(Normalizer::Sku),
            FieldRule::new("price", "price", DecimalMoney).required(),
            FieldRule::new("title", "title", Text),
            FieldRule::new("barcode", "barcode", Text),
        ],
        (Platform::Warehouse, EntityKind::Variant) => vec![
            FieldRule::new("sku", "article", Text).required().normalized(Normalizer::Sku),
            FieldRule::new("price", "salePrice", MinorUnits).required(),
            FieldRule::new("title", "name", Text),
            FieldRule::new("barcode", "barcode", Text),
        ],
        (Platform::Storefront, EntityKind::InventoryLevel) => vec![
            FieldRule::new("sku", "sku", Text).required().normalized(Normalizer::Sku),
            FieldRule::new("quantity", "available", Integer).required(),
        ],
        (Platform::Warehouse, EntityKind::InventoryLevel) => vec![
            FieldRule::new("sku", "article", Text).required().normalized(Normalizer::Sku),
            FieldRule::new("quantity", "stock", Integer).required(),
        ],
        (Platform::Storefront, EntityKind::Order) => vec![
            FieldRule::new("order_number", "name", Text).required(),
            FieldRule::new("total", "totalPrice", DecimalMoney).required(),
            FieldRule::new("currency", "currency", Text)
                .required()
                .normalized(Normalizer::Currency),
            FieldRule::new("customer_email", "email", Text),
            FieldRule::new("status", "financialStatus", Text),
        ],
        (Platform::Warehouse, EntityKind::Order) => vec![
            FieldRule::new("order_number", "name", Text).required(),
            FieldRule::new("total", "sum", MinorUnits).required(),
            FieldRule::new("currency", "currency", Text)
                .required()
                .normalized(Normalizer::Currency),
            FieldRule::new("customer_email", "agentEmail", Text),
            FieldRule::new("status", "state", Text),
        ],
    }
}

// =============================================================================
// Mapper
// =============================================================================

/// Holds one [`MappingTable`] per (platform, kind).
#[derive(Debug, Clone)]
pub struct Mapper {
    tables: HashMap<(Platform, EntityKind), MappingTable>,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    /// Builds the mapper with the built-in tables.
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for platform in Platform::ALL {
            let ignored = match platform {
                Platform::Storefront => STOREFRONT_IGNORED,
                Platform::Warehouse => WAREHOUSE_IGNORED,
            };
            for kind in EntityKind::ALL {
                tables.insert(
                    (platform, kind),
                    MappingTable {
                        platform,
                        kind,
                        rules: default_rules(platform, kind),
                        ignored,
                    },
                );
            }
        }
        Mapper { tables }
    }

    /// Applies native column renames on top of the built-in tables.
    ///
    /// Fails when an override names a canonical field the kind does not have
    /// or would make two canonical fields share one native column.
    pub fn with_overrides(
        mut self,
        platform: Platform,
        overrides: &[FieldOverride],
    ) -> MappingResult<Self> {
        for o in overrides {
            let table = self.table_mut(platform, o.kind);
            let clash = table
                .rules
                .iter()
                .any(|r| r.native == o.native && r.canonical != o.canonical);
            if clash {
                return Err(MappingError::InvalidValue {
                    field: o.native.clone(),
                    reason: format!("native column already mapped for {}", o.kind),
                });
            }

            let unknown = table.unknown(&o.canonical);
            let rule = table
                .rules
                .iter_mut()
                .find(|r| r.canonical == o.canonical)
                .ok_or(unknown)?;
            rule.native = o.native.clone();
        }
        Ok(self)
    }

    pub fn table(&self, platform: Platform, kind: EntityKind) -> &MappingTable {
        // Every (platform, kind) pair is populated in `new`.
        &self.tables[&(platform, kind)]
    }

    fn table_mut(&mut self, platform: Platform, kind: EntityKind) -> &mut MappingTable {
        self.tables
            .entry((platform, kind))
            .or_insert_with(|| MappingTable {
                platform,
                kind,
                rules: default_rules(platform, kind),
                ignored: &[],
            })
    }

    /// Native payload → canonical entity (without identity).
    pub fn to_canonical(
        &self,
        platform: Platform,
        payload: &NativePayload,
    ) -> MappingResult<CanonicalEntity> {
        let kind = payload.kind();
        let fields = self.table(platform, kind).to_canonical(payload.body())?;
        Ok(CanonicalEntity::new(kind, fields))
    }

    /// Canonical entity → native payload for `platform`.
    pub fn to_native(
        &self,
        platform: Platform,
        entity: &CanonicalEntity,
    ) -> MappingResult<NativePayload> {
        let kind = entity.kind();
        let body = self.table(platform, kind).to_native(entity.fields())?;
        Ok(NativePayload::new(kind, body))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
