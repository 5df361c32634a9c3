//! # Change Sources
//!
//! Turns platform activity into [`ChangeEvent`]s, whether it arrives by
//! polling or by webhook.
//!
//! ## Two Inputs, One Event Type
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  poll_changes(kind, cursor) ──► PlatformApi::list ──┐                  │
//! │                                                      ├──► ChangeEvent   │
//! │  ingest(RawWebhook) ──► verify signature ──► parse ──┘                  │
//! │                                                                         │
//! │  ChangeFeed::pages() walks poll_changes until has_more == false        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ingest` is synchronous and does no I/O: the webhook handler verifies and
//! parses in-line, then hands the event to the durable inbox.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use stockbridge_core::{ChangeEvent, EntityKind, Platform};

use crate::api::{NativeRecord, PlatformApi};
use crate::error::{SyncResult, ValidationError};

// =============================================================================
// Types
// =============================================================================

/// One batch of polled changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub events: Vec<ChangeEvent>,
    /// Checkpoint to persist once the page is handled.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Listing rows dropped as unparseable.
    pub skipped: usize,
}

/// A webhook delivery as received: headers and the untouched body bytes.
#[derive(Debug, Clone, Default)]
pub struct RawWebhook {
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl RawWebhook {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        RawWebhook {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

// =============================================================================
// Change Source Trait
// =============================================================================

/// Produces change events for one platform.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    fn platform(&self) -> Platform;

    /// Changes of `kind` after `since`; `None` starts from the beginning.
    async fn poll_changes(&self, kind: EntityKind, since: Option<&str>) -> SyncResult<ChangePage>;

    /// Verifies and parses one webhook delivery.
    ///
    /// The signature is checked before the body is looked at.
    fn ingest(&self, raw: &RawWebhook) -> Result<ChangeEvent, ValidationError>;

    /// Re-reads one record; used when a write lost a race.
    async fn fetch_current(&self, kind: EntityKind, native_id: &str) -> SyncResult<Option<ChangeEvent>>;
}

// =============================================================================
// Shared Helpers
// =============================================================================

pub(crate) fn record_to_event(platform: Platform, record: NativeRecord) -> ChangeEvent {
    ChangeEvent {
        platform,
        native_id: record.id.clone(),
        kind: record.kind,
        revision: record.revision.clone(),
        payload: record.payload(),
        changed_at: record.changed_at,
        observed_at: Utc::now(),
    }
}

/// `poll_changes` in terms of [`PlatformApi::list`].
pub(crate) async fn poll_via(
    api: &dyn PlatformApi,
    kind: EntityKind,
    since: Option<&str>,
    page_size: u32,
) -> SyncResult<ChangePage> {
    let page = api.list(kind, since, page_size).await?;
    let platform = api.platform();

    debug!(
        platform = %platform,
        kind = %kind,
        records = page.records.len(),
        skipped = page.skipped,
        has_more = page.has_more,
        "Polled page"
    );

    Ok(ChangePage {
        events: page
            .records
            .into_iter()
            .map(|r| record_to_event(platform, r))
            .collect(),
        next_cursor: page.next_cursor,
        has_more: page.has_more,
        skipped: page.skipped,
    })
}

/// `fetch_current` in terms of [`PlatformApi::get`].
pub(crate) async fn fetch_via(
    api: &dyn PlatformApi,
    kind: EntityKind,
    native_id: &str,
) -> SyncResult<Option<ChangeEvent>> {
    let platform = api.platform();
    Ok(api
        .get(kind, native_id)
        .await?
        .map(|r| record_to_event(platform, r)))
}

// =============================================================================
// Change Feed
// =============================================================================

/// Lazy walk over every page of a source.
pub struct ChangeFeed;

impl ChangeFeed {
    /// Pages from `since` until the source reports no more.
    ///
    /// An error ends the stream after it is yielded.
    pub fn pages(
        source: Arc<dyn ChangeSource>,
        kind: EntityKind,
        since: Option<String>,
    ) -> BoxStream<'static, SyncResult<ChangePage>> {
        // Outer None = finished; inner Option = the cursor to resume from.
        stream::unfold(Some(since), move |state| {
            let source = source.clone();
            async move {
                let cursor = state?;
                match source.poll_changes(kind, cursor.as_deref()).await {
                    Ok(page) => {
                        let next = match (&page.next_cursor, page.has_more) {
                            (Some(c), true) if Some(c) != cursor.as_ref() => Some(Some(c.clone())),
                            _ => None,
                        };
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }

    /// Every event across all pages, in order.
    pub fn events(
        source: Arc<dyn ChangeSource>,
        kind: EntityKind,
        since: Option<String>,
    ) -> BoxStream<'static, SyncResult<ChangeEvent>> {
        Self::pages(source, kind, since)
            .flat_map(|page| match page {
                Ok(page) => stream::iter(page.events.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(e) => stream::iter(vec![Err(e)]),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;
    use crate::storefront::StorefrontSource;
    use futures_util::TryStreamExt;
    use serde_json::json;

    #[test]
    fn test_raw_webhook_headers_are_case_insensitive() {
        let raw = RawWebhook::new(b"{}".to_vec()).with_header("X-Shopify-Topic", "products/update");
        assert_eq!(raw.header("x-shopify-topic"), Some("products/update"));
        assert_eq!(raw.header("X-SHOPIFY-TOPIC"), Some("products/update"));
        assert_eq!(raw.header("x-missing"), None);
    }

    #[tokio::test]
    async fn test_feed_walks_every_page() {
        let fake = Arc::new(FakePlatform::new(Platform::Storefront));
        for i in 0..5 {
            fake.seed(
                EntityKind::InventoryLevel,
                json!({"sku": format!("SKU-{i}"), "available": i}),
            );
        }

        let source: Arc<dyn ChangeSource> =
            Arc::new(StorefrontSource::new(fake.clone(), b"secret".to_vec(), 2));

        let pages: Vec<ChangePage> = ChangeFeed::pages(source.clone(), EntityKind::InventoryLevel, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert!(!pages[2].has_more);

        let events: Vec<ChangeEvent> = ChangeFeed::events(source, EntityKind::InventoryLevel, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.windows(2).all(|w| w[0].revision < w[1].revision));
    }

    #[tokio::test]
    async fn test_feed_resumes_from_cursor() {
        let fake = Arc::new(FakePlatform::new(Platform::Storefront));
        fake.seed(EntityKind::InventoryLevel, json!({"sku": "A-1", "available": 1}));
        let source: Arc<dyn ChangeSource> =
            Arc::new(StorefrontSource::new(fake.clone(), b"secret".to_vec(), 10));

        let first: Vec<ChangePage> = ChangeFeed::pages(source.clone(), EntityKind::InventoryLevel, None)
            .try_collect()
            .await
            .unwrap();
        let cursor = first.last().and_then(|p| p.next_cursor.clone());
        assert!(cursor.is_some());

        fake.seed(EntityKind::InventoryLevel, json!({"sku": "B-2", "available": 2}));
        let events: Vec<ChangeEvent> = ChangeFeed::events(source, EntityKind::InventoryLevel, cursor)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.body()["sku"], "B-2");
    }
}
