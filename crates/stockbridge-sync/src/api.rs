//! # Platform API
//!
//! Record-level access to one platform, plus the shared reqwest client the
//! HTTP implementations are built on.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Executor / ChangeSource                                                │
//! │        │  list · get · create · update (+ Idempotency-Key)              │
//! │        ▼                                                                │
//! │  dyn PlatformApi ──┬── StorefrontApi (storefront.rs) ─┐                 │
//! │                    ├── WarehouseApi  (warehouse.rs) ──┼──► HttpClient   │
//! │                    └── FakePlatform  (tests)          │    (reqwest)    │
//! │                                                       ▼                 │
//! │                                    bearer auth, timeout, status mapping │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Method, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use stockbridge_core::{EntityKind, IdempotencyToken, JsonMap, NativePayload, Platform, Revision};

use crate::error::{is_retryable_status, SyncError, SyncResult};

/// Longest error body kept in an [`ApiError::Status`] message.
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Records
// =============================================================================

/// One record as a platform returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRecord {
    pub id: String,
    pub kind: EntityKind,
    pub revision: Revision,
    /// Native modification time.
    pub changed_at: DateTime<Utc>,
    /// Full native body, metadata included.
    pub body: JsonMap,
}

impl NativeRecord {
    pub fn payload(&self) -> NativePayload {
        NativePayload::new(self.kind, self.body.clone())
    }
}

/// One page of a change listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<NativeRecord>,
    /// Where the next call resumes; also the checkpoint to persist.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Rows left out because they could not be parsed.
    pub skipped: usize,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure of a single platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// A success status with a body we could not use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transport failures and 408/429/5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => is_retryable_status(*status),
            ApiError::Timeout | ApiError::Connection(_) | ApiError::InvalidResponse(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Connection(err.to_string())
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status { status, message, .. } => SyncError::Http { status, message },
            ApiError::Timeout => SyncError::Timeout("platform request".into()),
            ApiError::Connection(msg) => SyncError::ConnectionFailed(msg),
            ApiError::InvalidResponse(msg) => SyncError::InvalidResponse(msg),
        }
    }
}

// =============================================================================
// Platform API Trait
// =============================================================================

/// Record-level operations on one platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    fn platform(&self) -> Platform;

    /// Records of `kind` changed since `cursor`, oldest first.
    async fn list(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage, ApiError>;

    /// Current state of one record; `None` when it does not exist.
    async fn get(&self, kind: EntityKind, native_id: &str) -> Result<Option<NativeRecord>, ApiError>;

    async fn create(
        &self,
        kind: EntityKind,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError>;

    async fn update(
        &self,
        kind: EntityKind,
        native_id: &str,
        body: &JsonMap,
        key: &IdempotencyToken,
    ) -> Result<NativeRecord, ApiError>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// JSON-over-HTTPS client shared by the platform implementations.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        // Url::join replaces the last segment unless the base ends with '/'
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stockbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(HttpClient {
            client,
            base,
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Connection(format!("bad path {path:?}: {e}")))
    }

    /// GET returning `None` on 404.
    pub async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Option<Value>, ApiError> {
        let url = self.url(path)?;
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(response).await.map(Some)
    }

    /// POST / PUT with an `Idempotency-Key` header.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        key: &IdempotencyToken,
    ) -> Result<Value, ApiError> {
        let url = self.url(path)?;
        debug!(url = %url, method = %method, idempotency_key = %key, "Sending write");

        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Idempotency-Key", key.as_str())
            .json(body)
            .send()
            .await?;

        read_json(response).await
    }
}

async fn read_json(response: Response) -> Result<Value, ApiError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()));
    }

    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| message.is_char_boundary(*i))
            .unwrap_or(0);
        message.truncate(cut);
    }

    warn!(status = status.as_u16(), retry_after = ?retry_after, "Platform returned error status");

    Err(ApiError::Status {
        status: status.as_u16(),
        message,
        retry_after,
    })
}

/// Parses `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

// =============================================================================
// Record Parsing Helpers
// =============================================================================

/// Native ids arrive as strings or numbers.
pub(crate) fn native_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses listing rows one by one. A row that fails is logged and counted,
/// the rest of the page still comes back.
pub(crate) fn parse_rows(
    platform: Platform,
    kind: EntityKind,
    rows: Vec<Value>,
    parse: impl Fn(EntityKind, Value) -> Result<NativeRecord, String>,
) -> (Vec<NativeRecord>, usize) {
    let mut records = Vec::with_capacity(rows.len());
    let mut skipped = 0;

    for row in rows {
        let row_id = native_id(row.get("id"));
        match parse(kind, row) {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(
                    platform = %platform,
                    kind = %kind,
                    native_id = row_id.as_deref().unwrap_or("?"),
                    reason = %reason,
                    "Skipping malformed listing row"
                );
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

pub(crate) fn into_object(value: Value, what: &str) -> Result<JsonMap, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("{what} is not an object: {other}")),
    }
}
