//! # Webhook & Operator Server
//!
//! Inbound HTTP surface of the bridge.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST   /webhooks/{platform}           verify → inbox → 200            │
//! │                                        bad/missing signature → 401     │
//! │                                        inbox full            → 429     │
//! │                                        unparseable           → 400     │
//! │                                                                         │
//! │  GET    /dead-letters?limit&offset     newest first                    │
//! │  POST   /dead-letters/{id}/requeue     back to the outbox, attempts 0  │
//! │  DELETE /dead-letters/{id}             discard                          │
//! │                                                                         │
//! │  GET    /health                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A webhook is acknowledged only after its event is committed to the
//! durable inbox; reconciliation happens later on the engine task, which is
//! woken through a [`Notify`].

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stockbridge_core::{DeadLetterRecord, Platform};
use stockbridge_db::{Database, InboxPush};

use crate::error::{SyncError, SyncResult, ValidationError};
use crate::source::{ChangeSource, RawWebhook};

/// Seconds a saturated sender is told to wait.
const SATURATED_RETRY_AFTER_SECS: u64 = 5;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;

// =============================================================================
// State
// =============================================================================

/// Shared by every request handler.
pub struct WebhookState {
    db: Database,
    sources: HashMap<Platform, Arc<dyn ChangeSource>>,
    inbox_capacity: u32,
    /// Signalled after each accepted event.
    wake: Arc<Notify>,
}

impl WebhookState {
    pub fn new(
        db: Database,
        sources: HashMap<Platform, Arc<dyn ChangeSource>>,
        inbox_capacity: u32,
        wake: Arc<Notify>,
    ) -> Self {
        WebhookState {
            db,
            sources,
            inbox_capacity,
            wake,
        }
    }
}

/// Builds the router; exposed for in-process tests.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/{platform}", post(receive_webhook))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/requeue", post(requeue_dead_letter))
        .route("/dead-letters/{id}", delete(purge_dead_letter))
        .route("/health", get(health_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

pub struct WebhookServer {
    bind_address: String,
    state: Arc<WebhookState>,
}

/// Handle for a running server.
#[derive(Clone)]
pub struct WebhookHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl WebhookHandle {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and lets in-flight requests finish.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Webhook shutdown channel closed".into()))
    }
}

impl WebhookServer {
    pub fn new(bind_address: impl Into<String>, state: WebhookState) -> Self {
        WebhookServer {
            bind_address: bind_address.into(),
            state: Arc::new(state),
        }
    }

    /// Binds and serves in a background task.
    pub async fn start(self) -> SyncResult<WebhookHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::ServerFailed(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::ServerFailed(e.to_string()))?;

        info!(addr = %local_addr, "Webhook server started");

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Webhook server shutting down");
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "Webhook server failed");
            }
        });

        Ok(WebhookHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedBody {
    pub accepted: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequeuedBody {
    pub operation_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub database: bool,
    pub inbox: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Store failures surface as 500 without leaking details.
fn internal(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "Request failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

// =============================================================================
// Webhook Handler
// =============================================================================

fn raw_webhook(headers: &HeaderMap, body: Bytes) -> RawWebhook {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .fold(RawWebhook::new(body.to_vec()), |raw, (name, value)| {
            raw.with_header(name, value)
        })
}

async fn receive_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(source) = platform
        .parse::<Platform>()
        .ok()
        .and_then(|p| state.sources.get(&p))
    else {
        return failure(StatusCode::NOT_FOUND, format!("unknown platform '{platform}'"));
    };

    let raw = raw_webhook(&headers, body);
    let event = match source.ingest(&raw) {
        Ok(event) => event,
        Err(ValidationError::BadSignature) => {
            warn!(platform = %platform, "Rejected webhook with bad signature");
            return failure(StatusCode::UNAUTHORIZED, "invalid signature");
        }
        Err(e) => {
            debug!(platform = %platform, error = %e, "Rejected webhook");
            return failure(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.db.inbox().push(&event, state.inbox_capacity, Utc::now()).await {
        Ok(InboxPush::Accepted(id)) => {
            debug!(
                inbox_id = id,
                platform = %event.platform,
                native_id = %event.native_id,
                "Webhook accepted"
            );
            state.wake.notify_one();
            (StatusCode::OK, Json(AcceptedBody { accepted: id })).into_response()
        }
        Ok(InboxPush::Saturated) => {
            warn!(capacity = state.inbox_capacity, "Inbox saturated, refusing webhook");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, SATURATED_RETRY_AFTER_SECS.to_string())],
                Json(ErrorBody {
                    error: "inbox saturated".into(),
                }),
            )
                .into_response()
        }
        Err(e) => internal(e),
    }
}

// =============================================================================
// Dead-Letter Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_dead_letters(
    State(state): State<Arc<WebhookState>>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<DeadLetterRecord>>, Response> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    state
        .db
        .dead_letters()
        .list(limit, page.offset.unwrap_or(0))
        .await
        .map(Json)
        .map_err(internal)
}

async fn requeue_dead_letter(
    State(state): State<Arc<WebhookState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.db.dead_letters().requeue(id, Utc::now()).await {
        Ok(Some(queued)) => {
            info!(dead_letter = %id, operation_id = %queued.id, "Dead letter requeued");
            Json(RequeuedBody {
                operation_id: queued.id,
            })
            .into_response()
        }
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("no dead letter {id}")),
        Err(e) => internal(e),
    }
}

async fn purge_dead_letter(
    State(state): State<Arc<WebhookState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.db.dead_letters().purge(id).await {
        Ok(true) => {
            info!(dead_letter = %id, "Dead letter purged");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("no dead letter {id}")),
        Err(e) => internal(e),
    }
}

async fn health_handler(State(state): State<Arc<WebhookState>>) -> Json<HealthBody> {
    let database = state.db.health_check().await;
    let inbox = state.db.inbox().count().await.unwrap_or(-1);
    Json(HealthBody {
        status: if database { "ok" } else { "degraded" }.to_string(),
        database,
        inbox,
    })
}
