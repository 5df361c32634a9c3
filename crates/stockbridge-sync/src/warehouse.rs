//! # Warehouse Adapter
//!
//! REST client and change source for the warehouse platform.
//!
//! ## Endpoints
//! ```text
//! GET  {base}/entity/{type}?limit&offset&order=updated,asc&filter=updated>=T  → { "rows": [...] }
//! GET  {base}/entity/{type}/{id}
//! POST {base}/entity/{type}
//! PUT  {base}/entity/{type}/{id}
//! ```
//!
//! ## Cursor
//! The listing has no opaque cursor, so we build one: `"{offset}:{since}"`.
//! A short page resets the offset and moves `since` to the newest
//! `updated` value seen, counting rows that failed to parse so a bad row is
//! not fetched forever. Records stamped exactly at `since` are listed again
//! on the next pass and resolve to no-ops.
//!
//! ## Revisions
//! Always `updated` in epoch microseconds. The `version` counter some
//! entities carry is ignored: it lives on a different scale and would not
//! compare against timestamps already stored on a binding.
//!
//! Webhooks carry `{"entityType": "...", "entity": {...}}` signed with a hex
//! HMAC-SHA256 in `X-Warehouse-Signature`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

use stockbridge_core::{ChangeEvent, EntityKind, IdempotencyToken, JsonMap, Platform, Revision};

use crate::api::{into_object, native_id, parse_rows, ApiError, HttpClient, NativeRecord, PlatformApi, RecordPage};
use crate::config::PlatformSettings;
use crate::error::{SyncResult, ValidationError};
use crate::signature;
use crate::source::{fetch_via, poll_via, record_to_event, ChangePage, ChangeSource, RawWebhook};

pub const SIGNATURE_HEADER: &str = "X-Warehouse-Signature";

const UPDATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

fn entity_type(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "product",
        EntityKind::Variant => "variant",
        EntityKind::InventoryLevel => "stock",
        EntityKind::Order => "customerorder",
    }
}

fn kind_for_entity_type(name: &str) -> Option<EntityKind> {
    EntityKind::ALL.into_iter().find(|k| entity_type(*k) == name)
}

/// `"2026-03-01 10:00:00.000"` (UTC) or RFC 3339.
fn parse_updated(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, UPDATED_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        })
}

fn parse_record(kind: EntityKind, value: Value) -> Result<NativeRecord, String> {
    let body = into_object(value, entity_type(kind))?;
    let id = native_id(body.get("id")).ok_or("record has no id")?;
    let updated = body
        .get("updated")
        .and_then(Value::as_str)
        .ok_or("record has no updated")?;
    let changed_at = parse_updated(updated).ok_or_else(|| format!("bad updated {updated:?}"))?;

    Ok(NativeRecord {
        id,
        kind,
        revision: Revision::from_timestamp(changed_at),
        changed_at,
        body,
    })
}

/// `"{offset}:{since}"`; missing or garbled parts fall back to the start.
fn parse_cursor(cursor: Option<&str>) -> (u64, Option<String>) {
    let Some((offset, since)) = cursor.and_then(|c| c.split_once(':')) else {
        return (0, None);
    };
    let since = (!since.is_empty()).then(|| since.to_string());
    (offset.parse().unwrap_or(0), since)
}

// =============================================================================
// API
// =============================================================================

#[derive(Debug, Clone)]
pub struct WarehouseApi {
    http: HttpClient,
}

impl WarehouseApi {
    pub fn new(http: HttpClient) -> Self {
        WarehouseApi { http }
    }

    pub fn from_settings(settings: &PlatformSettings) -> SyncResult<Self> {
        let http = HttpClient::new(
            &settings.base_url,
            settings.access_token.clone(),
            settings.request_timeout(),
        )?;
        Ok(Self::new(http))
    }
}

#[async_trait]
impl PlatformApi for WarehouseApi {
    fn platform(&self) -> Platform {
        Platform::Warehouse
    }

    async fn list(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage, ApiError> {
        let (offset, since) = parse_cursor(cursor);

        let mut query = vec![
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("order", "updated,asc".to_string()),
        ];
        if let Some(since) = &since {
            query.push(("filter", format!("updated>={since}")));
        }

        let path = format!("entity/{}", entity_type(kind));
        let value = self.http.get_json(&path, &query).await?.ok_or_else(|| ApiError::Status {
            status: 404,
            message: format!("{path} not found"),
            retry_after: None,
        })?;

        let rows = value
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ApiError::InvalidResponse("missing 'rows' array".into()))?;
        let row_count = rows.len() as u64;
        let newest = rows
            .iter()
            .filter_map(|row| row.get("updated").and_then(Value::as_str))
            .filter(|updated| parse_updated(updated).is_some())
            .max()
            .map(str::to_string);

        let (records, skipped) = parse_rows(Platform::Warehouse, kind, rows, parse_record);

        let has_more = limit > 0 && row_count >= u64::from(limit);
        let since = since.unwrap_or_default();
        let next_cursor = if has_more {
            format!("{}:{}", offset + row_count, since)
        } else {
            format!("0:{}", newest.filter(|n| *n > since).unwrap_or(since))
        };

        Ok(RecordPage {
            records,
            next_cursor: Some(next_cursor),
            has_more,
            skipped,
        })
    }

    async fn get(&self, kind: EntityKind, native_id: &str) -> Result<Option<NativeRecord>, ApiError> {
        let path = format!("entity/{}/{}", entity_type(kind), native_id);
        match self.http.get_json(&path, &[]).await? {
            Some(value) => parse_record(kind, value)
                .map(Some)
                .map_err(ApiError::InvalidResponse),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        kind: EntityKind,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        let path = format!("entity/{}", entity_type(kind));
        let value = self
            .http
            .send_json(Method::POST, &path, &Value::Object(body.clone()), key)
            .await?;
        parse_record(kind, value).map_err(ApiError::InvalidResponse)
    }

    async fn update(
        &self,
        kind: EntityKind,
        native_id: &str,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError> {
        let path = format!("entity/{}/{}", entity_type(kind), native_id);
        let value = self
            .http
            .send_json(Method::PUT, &path, &Value::Object(body.clone()), key)
            .await?;
        parse_record(kind, value).map_err(ApiError::InvalidResponse)
    }
}

// =============================================================================
// Change Source
// =============================================================================

pub struct WarehouseSource {
    api: Arc<dyn PlatformApi>,
    secret: Vec<u8>,
    page_size: u32,
}

impl WarehouseSource {
    pub fn new(api: Arc<dyn PlatformApi>, secret: Vec<u8>, page_size: u32) -> Self {
        WarehouseSource {
            api,
            secret,
            page_size,
        }
    }
}

#[async_trait]
impl ChangeSource for WarehouseSource {
    fn platform(&self) -> Platform {
        Platform::Warehouse
    }

    async fn poll_changes(&self, kind: EntityKind, since: Option<&str>) -> SyncResult<ChangePage> {
        poll_via(self.api.as_ref(), kind, since, self.page_size).await
    }

    fn ingest(&self, raw: &RawWebhook) -> Result<ChangeEvent, ValidationError> {
        let signature = raw
            .header(SIGNATURE_HEADER)
            .ok_or(ValidationError::BadSignature)?;
        if !signature::verify_hex(&self.secret, raw.body(), signature) {
            return Err(ValidationError::BadSignature);
        }

        let mut envelope: JsonMap = serde_json::from_slice(raw.body())
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let type_name = envelope
            .get("entityType")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::Malformed("missing entityType".into()))?
            .to_string();
        let kind = kind_for_entity_type(&type_name).ok_or(ValidationError::UnknownTopic(type_name))?;

        let entity = envelope
            .remove("entity")
            .ok_or_else(|| ValidationError::Malformed("missing entity".into()))?;
        let record = parse_record(kind, entity).map_err(ValidationError::Malformed)?;

        Ok(record_to_event(Platform::Warehouse, record))
    }

    async fn fetch_current(&self, kind: EntityKind, native_id: &str) -> SyncResult<Option<ChangeEvent>> {
        fetch_via(self.api.as_ref(), kind, native_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"warehouse-secret";

    fn source() -> WarehouseSource {
        WarehouseSource::new(Arc::new(FakePlatform::new(Platform::Warehouse)), SECRET.to_vec(), 50)
    }

    fn signed(body: &Value) -> RawWebhook {
        let bytes = serde_json::to_vec(body).unwrap();
        let sig = signature::sign_hex(SECRET, &bytes);
        RawWebhook::new(bytes).with_header(SIGNATURE_HEADER, sig)
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor(None), (0, None));
        assert_eq!(parse_cursor(Some("0:")), (0, None));
        assert_eq!(
            parse_cursor(Some("100:2026-03-01 10:00:00.000")),
            (100, Some("2026-03-01 10:00:00.000".into()))
        );
        assert_eq!(parse_cursor(Some("garbage")), (0, None));
    }

    #[test]
    fn test_revision_is_always_the_update_time() {
        let without = parse_record(
            EntityKind::Product,
            json!({"id": "a", "updated": "2026-03-01 10:00:00.000"}),
        )
        .unwrap();
        assert_eq!(without.revision, Revision::from_timestamp(without.changed_at));
        assert_eq!(without.changed_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");

        let versioned_later = parse_record(
            EntityKind::Product,
            json!({"id": "a", "updated": "2026-03-01 11:00:00.000", "version": 7}),
        )
        .unwrap();
        assert_eq!(versioned_later.revision, Revision::from_timestamp(versioned_later.changed_at));
        assert!(versioned_later.revision > without.revision);
    }

    #[test]
    fn test_ingest_valid_delivery() {
        let event = source()
            .ingest(&signed(&json!({
                "entityType": "stock",
                "entity": {"id": "st-1", "article": "MUG-01", "stock": 5, "updated": "2026-03-01 10:00:00.000"}
            })))
            .unwrap();

        assert_eq!(event.platform, Platform::Warehouse);
        assert_eq!(event.kind, EntityKind::InventoryLevel);
        assert_eq!(event.native_id, "st-1");
        assert_eq!(event.payload.body()["stock"], 5);
    }

    #[test]
    fn test_ingest_rejections() {
        let raw = RawWebhook::new(b"{}".to_vec()).with_header(SIGNATURE_HEADER, "00");
        assert_eq!(source().ingest(&raw).unwrap_err(), ValidationError::BadSignature);

        let err = source()
            .ingest(&signed(&json!({"entityType": "invoice", "entity": {}})))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownTopic("invoice".into()));

        let err = source().ingest(&signed(&json!({"entityType": "product"}))).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_list_builds_offset_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entity/product"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [
                    {"id": "p1", "name": "Mug", "code": "mug", "updated": "2026-03-01 10:00:00.000"},
                    {"id": "p2", "name": "Cup", "code": "cup", "updated": "2026-03-01 11:00:00.000"}
                ]
            })))
            .mount(&server)
            .await;

        let http = HttpClient::new(&server.uri(), "t", Duration::from_secs(5)).unwrap();
        let api = WarehouseApi::new(http);

        let full = api.list(EntityKind::Product, None, 2).await.unwrap();
        assert!(full.has_more);
        assert_eq!(full.next_cursor.as_deref(), Some("2:"));

        let short = api.list(EntityKind::Product, None, 10).await.unwrap();
        assert!(!short.has_more);
        assert_eq!(short.next_cursor.as_deref(), Some("0:2026-03-01 11:00:00.000"));
    }

    #[tokio::test]
    async fn test_malformed_row_does_not_sink_the_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entity/stock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [
                    {"id": "s1", "article": "MUG-01", "stock": 4, "updated": "2026-03-01 10:00:00.000"},
                    {"id": "s2", "article": "CUP-02", "stock": 1},
                    {"article": "BOWL-03", "stock": 2, "updated": "2026-03-01 12:00:00.000"}
                ]
            })))
            .mount(&server)
            .await;

        let http = HttpClient::new(&server.uri(), "t", Duration::from_secs(5)).unwrap();
        let api = WarehouseApi::new(http);
        let page = api.list(EntityKind::InventoryLevel, None, 10).await.unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "s1");
        assert_eq!(page.skipped, 2);
        assert!(!page.has_more);
        // The cursor moves past the broken rows too
        assert_eq!(page.next_cursor.as_deref(), Some("0:2026-03-01 12:00:00.000"));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entity/product"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
            .mount(&server)
            .await;

        let http = HttpClient::new(&server.uri(), "t", Duration::from_secs(5)).unwrap();
        let api = WarehouseApi::new(http);
        let page = api
            .list(EntityKind::Product, Some("0:2026-03-01 10:00:00.000"), 10)
            .await
            .unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("0:2026-03-01 10:00:00.000"));
    }
}
