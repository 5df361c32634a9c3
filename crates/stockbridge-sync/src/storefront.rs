//! # Storefront Adapter
//!
//! REST client and change source for the storefront platform.
//!
//! ## Endpoints
//! ```text
//! GET  {base}/{collection}.json?limit=N&order=updated_at+asc&updated_at_min=T
//! GET  {base}/{collection}.json?limit=N&page_info=P    → { "<collection>": [...],
//!                                                         "pageInfo": { hasNextPage, endCursor } }
//! GET  {base}/{collection}/{id}.json                  → { "<singular>": {...} }
//! POST {base}/{collection}.json        { "<singular>": {...} }
//! PUT  {base}/{collection}/{id}.json   { "<singular>": {...} }
//! ```
//!
//! ## Cursor
//! `"{since}"` between passes, `"{since}|{page_info}"` while walking pages.
//! `since` is the newest `updatedAt` seen so far; the first page of a pass
//! asks for everything updated at or after it, so edits to records listed
//! before come back. `page_info` carries the filter on later pages.
//!
//! Webhooks carry `X-Shopify-Topic` (`products/update`, ...) and a base64
//! HMAC-SHA256 of the body in `X-Shopify-Hmac-Sha256`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

use stockbridge_core::{ChangeEvent, EntityKind, IdempotencyToken, JsonMap, Platform, Revision};

use crate::api::{into_object, native_id, parse_rows, ApiError, HttpClient, NativeRecord, PlatformApi, RecordPage};
use crate::config::PlatformSettings;
use crate::error::{SyncResult, ValidationError};
use crate::signature;
use crate::source::{fetch_via, poll_via, record_to_event, ChangePage, ChangeSource, RawWebhook};

pub const SIGNATURE_HEADER: &str = "X-Shopify-Hmac-Sha256";
pub const TOPIC_HEADER: &str = "X-Shopify-Topic";

fn collection(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "products",
        EntityKind::Variant => "variants",
        EntityKind::InventoryLevel => "inventory_levels",
        EntityKind::Order => "orders",
    }
}

fn singular(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "product",
        EntityKind::Variant => "variant",
        EntityKind::InventoryLevel => "inventory_level",
        EntityKind::Order => "order",
    }
}

/// `products/update` → Product. Deletions are not synced.
fn kind_for_topic(topic: &str) -> Option<EntityKind> {
    let (resource, action) = topic.split_once('/')?;
    if action == "delete" {
        return None;
    }
    EntityKind::ALL
        .into_iter()
        .find(|k| collection(*k) == resource)
}

fn wrap(kind: EntityKind, body: &JsonMap) -> Value {
    let mut outer = JsonMap::new();
    outer.insert(singular(kind).to_string(), Value::Object(body.clone()));
    Value::Object(outer)
}

fn parse_updated(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad updatedAt {value:?}: {e}"))
}

fn parse_record(kind: EntityKind, value: Value) -> Result<NativeRecord, String> {
    let body = into_object(value, singular(kind))?;
    let id = native_id(body.get("id")).ok_or("record has no id")?;
    let updated = body
        .get("updatedAt")
        .and_then(Value::as_str)
        .ok_or("record has no updatedAt")?;
    let changed_at = parse_updated(updated)?;

    Ok(NativeRecord {
        id,
        kind,
        revision: Revision::from_timestamp(changed_at),
        changed_at,
        body,
    })
}

/// Splits a cursor into `since` and the page token. A `since` that does not
/// parse restarts the listing from the beginning.
fn parse_cursor(cursor: Option<&str>) -> (Option<DateTime<Utc>>, Option<&str>) {
    let Some(cursor) = cursor else {
        return (None, None);
    };
    let (since, page_info) = match cursor.split_once('|') {
        Some((since, page_info)) => (since, Some(page_info).filter(|p| !p.is_empty())),
        None => (cursor, None),
    };
    (parse_updated(since).ok(), page_info)
}

fn format_since(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// =============================================================================
// API
// =============================================================================

#[derive(Debug, Clone)]
pub struct StorefrontApi {
    http: HttpClient,
}

impl StorefrontApi {
    pub fn new(http: HttpClient) -> Self {
        StorefrontApi { http }
    }

    pub fn from_settings(settings: &PlatformSettings) -> SyncResult<Self> {
        let http = HttpClient::new(
            &settings.base_url,
            settings.access_token.clone(),
            settings.request_timeout(),
        )?;
        Ok(Self::new(http))
    }

    fn unwrap_single(kind: EntityKind, value: Value) -> Result<NativeRecord, ApiError> {
        let inner = match value {
            Value::Object(mut map) => map.remove(singular(kind)).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        parse_record(kind, inner).map_err(ApiError::InvalidResponse)
    }
}

#[async_trait]
impl PlatformApi for StorefrontApi {
    fn platform(&self) -> Platform {
        Platform::Storefront
    }

    async fn list(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage, ApiError> {
        let (since, page_info) = parse_cursor(cursor);

        let mut query = vec![("limit", limit.to_string())];
        match page_info {
            Some(page_info) => query.push(("page_info", page_info.to_string())),
            None => {
                query.push(("order", "updated_at asc".to_string()));
                if let Some(since) = since {
                    query.push(("updated_at_min", format_since(since)));
                }
            }
        }

        let path = format!("{}.json", collection(kind));
        let value = self.http.get_json(&path, &query).await?.ok_or_else(|| ApiError::Status {
            status: 404,
            message: format!("{path} not found"),
            retry_after: None,
        })?;

        let rows = value
            .get(collection(kind))
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ApiError::InvalidResponse(format!("missing '{}' array", collection(kind))))?;

        // Rows that fail to parse still move `since` when their stamp is readable
        let newest = rows
            .iter()
            .filter_map(|row| row.get("updatedAt").and_then(Value::as_str))
            .filter_map(|updated| parse_updated(updated).ok())
            .chain(since)
            .max();

        let (records, skipped) = parse_rows(Platform::Storefront, kind, rows, parse_record);

        let page = value.get("pageInfo");
        let end_cursor = page
            .and_then(|p| p.get("endCursor"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty());
        let has_more = end_cursor.is_some()
            && page
                .and_then(|p| p.get("hasNextPage"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let since = newest.map(format_since).unwrap_or_default();
        let next_cursor = match end_cursor {
            Some(end) if has_more => Some(format!("{since}|{end}")),
            _ => newest.map(|_| since),
        };

        Ok(RecordPage {
            records,
            next_cursor,
            has_more,
            skipped,
        })
    }

    async fn get(&self, kind: EntityKind, native_id: &str) -> Result<Option<NativeRecord>, ApiError> {
        let path = format!("{}/{}.json", collection(kind), native_id);
        match self.http.get_json(&path, &[]).await? {
            Some(value) => Self::unwrap_single(kind, value).map(Some),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        kind: EntityKind,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        let path = format!("{}.json", collection(kind));
        let value = self
            .http
            .send_json(Method::POST, &path, &wrap(kind, body), key)
            .await?;
        Self::unwrap_single(kind, value)
    }

    async fn update(
        &self,
        kind: EntityKind,
        native_id: &str,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        let path = format!("{}/{}.json", collection(kind), native_id);
        let value = self
            .http
            .send_json(Method::PUT, &path, &wrap(kind, body), key)
            .await?;
        Self::unwrap_single(kind, value)
    }
}

// =============================================================================
// Change Source
// =============================================================================

pub struct StorefrontSource {
    api: Arc<dyn PlatformApi>,
    secret: Vec<u8>,
    page_size: u32,
}

impl StorefrontSource {
    pub fn new(api: Arc<dyn PlatformApi>, secret: Vec<u8>, page_size: u32) -> Self {
        StorefrontSource {
            api,
            secret,
            page_size,
        }
    }
}

#[async_trait]
impl ChangeSource for StorefrontSource {
    fn platform(&self) -> Platform {
        Platform::Storefront
    }

    async fn poll_changes(&self, kind: EntityKind, since: Option<&str>) -> SyncResult<ChangePage> {
        poll_via(self.api.as_ref(), kind, since, self.page_size).await
    }

    fn ingest(&self, raw: &RawWebhook) -> Result<ChangeEvent, ValidationError> {
        let signature = raw
            .header(SIGNATURE_HEADER)
            .ok_or(ValidationError::BadSignature)?;
        if !signature::verify_base64(&self.secret, raw.body(), signature) {
            return Err(ValidationError::BadSignature);
        }

        let topic = raw
            .header(TOPIC_HEADER)
            .ok_or(ValidationError::MissingHeader(TOPIC_HEADER))?;
        let kind = kind_for_topic(topic).ok_or_else(|| ValidationError::UnknownTopic(topic.to_string()))?;

        let value: Value =
            serde_json::from_slice(raw.body()).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let record = parse_record(kind, value).map_err(ValidationError::Malformed)?;

        Ok(record_to_event(Platform::Storefront, record))
    }

    async fn fetch_current(&self, kind: EntityKind, native_id: &str) -> SyncResult<Option<ChangeEvent>> {
        fetch_via(self.api.as_ref(), kind, native_id).await
    }
}
