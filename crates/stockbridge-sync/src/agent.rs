//! # Bridge Agent
//!
//! Main orchestrator. Builds the platform clients, change sources, engine,
//! executors and scheduler from a [`BridgeConfig`] and runs them as tasks.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       BridgeAgent Architecture                          │
//! │                                                                         │
//! │   webhook server ──► inbox ──(Notify)──┐                               │
//! │                                        ▼                                │
//! │   poll ticker ───────────────────► engine task ──► outbox              │
//! │                                        ▲              │                 │
//! │                 refresh (mpsc) ────────┘              ▼                 │
//! │                        ▲                        scheduler task          │
//! │                        └──── superseded ops ──────────┘                 │
//! │                                                                         │
//! │   BridgeHandle::shutdown flips a watch channel; every task exits at    │
//! │   its next select and the webhook server drains in-flight requests.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use stockbridge_core::{CanonicalId, EntityKind, Mapper, Platform};
use stockbridge_db::{Database, KeyedLocks};

use crate::api::PlatformApi;
use crate::config::BridgeConfig;
use crate::engine::{RunReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::executor::Executor;
use crate::rate_limit::TokenBucket;
use crate::scheduler::{RetryPolicy, Scheduler};
use crate::source::ChangeSource;
use crate::storefront::{StorefrontApi, StorefrontSource};
use crate::warehouse::{WarehouseApi, WarehouseSource};
use crate::webhook::{WebhookHandle, WebhookServer, WebhookState};

/// Superseded entities waiting for a re-read.
const REFRESH_QUEUE: usize = 1024;

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the engine task for external queries.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// Completed polling passes since start.
    pub passes: u64,

    /// When the last polling pass finished.
    pub last_pass: Option<DateTime<Utc>>,

    /// Counters from the last polling pass.
    pub last_report: RunReport,

    /// Last engine error (if any). Cleared by the next successful pass.
    pub last_error: Option<String>,
}

// =============================================================================
// Bridge Agent
// =============================================================================

pub struct BridgeAgent {
    config: Arc<BridgeConfig>,
    db: Database,
    engine: SyncEngine,
    scheduler: Scheduler,
    refresh_rx: mpsc::Receiver<CanonicalId>,
    wake: Arc<Notify>,
    status: Arc<RwLock<SyncStatus>>,
}

impl BridgeAgent {
    /// Builds HTTP clients for both platforms from `config`.
    pub fn from_config(config: BridgeConfig, db: Database) -> SyncResult<Self> {
        let storefront: Arc<dyn PlatformApi> =
            Arc::new(StorefrontApi::from_settings(&config.storefront)?);
        let warehouse: Arc<dyn PlatformApi> =
            Arc::new(WarehouseApi::from_settings(&config.warehouse)?);
        Self::with_components(config, db, storefront, warehouse)
    }

    /// Wires the bridge around the given platform clients.
    pub fn with_components(
        config: BridgeConfig,
        db: Database,
        storefront: Arc<dyn PlatformApi>,
        warehouse: Arc<dyn PlatformApi>,
    ) -> SyncResult<Self> {
        let policy = config.conflict_policy()?;

        let mapper = Arc::new(
            Mapper::new()
                .with_overrides(Platform::Storefront, &config.storefront.field_overrides)?
                .with_overrides(Platform::Warehouse, &config.warehouse.field_overrides)?,
        );

        let sources: Vec<Arc<dyn ChangeSource>> = vec![
            Arc::new(StorefrontSource::new(
                storefront.clone(),
                config.storefront.webhook_secret.as_bytes().to_vec(),
                config.storefront.page_size,
            )),
            Arc::new(WarehouseSource::new(
                warehouse.clone(),
                config.warehouse.webhook_secret.as_bytes().to_vec(),
                config.warehouse.page_size,
            )),
        ];

        // Shared between engine and scheduler; distinct from the store's CAS locks.
        let locks = Arc::new(KeyedLocks::new());
        let engine = SyncEngine::new(db.clone(), mapper.clone(), policy, sources, locks.clone());

        let lanes = [storefront, warehouse]
            .into_iter()
            .map(|api| {
                let settings = config.platform(api.platform());
                let limiter = Arc::new(TokenBucket::from_settings(&settings.rate_limit));
                let workers = settings.workers;
                (Executor::new(api, mapper.clone(), limiter, db.clone()), workers)
            })
            .collect();

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE);
        let scheduler = Scheduler::new(db.clone(), lanes, RetryPolicy::from_settings(&config.retry), locks)
            .with_refresh(refresh_tx)
            .batch_size(config.sync.batch_size);

        Ok(BridgeAgent {
            config: Arc::new(config),
            db,
            engine,
            scheduler,
            refresh_rx,
            wake: Arc::new(Notify::new()),
            status: Arc::new(RwLock::new(SyncStatus::default())),
        })
    }

    /// Starts the webhook server, the scheduler and the engine loop.
    pub async fn start(self) -> SyncResult<BridgeHandle> {
        let BridgeAgent {
            config,
            db,
            engine,
            scheduler,
            refresh_rx,
            wake,
            status,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let webhook = WebhookServer::new(
            config.webhook.socket_address(),
            WebhookState::new(
                db.clone(),
                engine.sources().clone(),
                config.webhook.inbox_capacity,
                wake.clone(),
            ),
        )
        .start()
        .await?;

        let scheduler_task = {
            let interval = config.scheduler_interval();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.run(interval, shutdown).await {
                    error!(error = %e, "Scheduler exited with error");
                }
            })
        };

        let engine_task = tokio::spawn(
            EngineLoop {
                engine,
                kinds: config.sync.kinds.clone(),
                batch: config.sync.batch_size,
                poll_interval: config.poll_interval(),
                wake,
                refresh_rx,
                status: status.clone(),
            }
            .run(shutdown_rx),
        );

        info!(
            webhook = %webhook.local_addr(),
            priority = ?config.conflict.priority,
            "Bridge started"
        );

        Ok(BridgeHandle {
            shutdown_tx,
            status,
            webhook,
            tasks: vec![scheduler_task, engine_task],
        })
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for a running bridge.
pub struct BridgeHandle {
    shutdown_tx: watch::Sender<bool>,
    status: Arc<RwLock<SyncStatus>>,
    webhook: WebhookHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    pub fn webhook_addr(&self) -> std::net::SocketAddr {
        self.webhook.local_addr()
    }

    /// Signals every task and waits for them to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down bridge");

        self.shutdown_tx
            .send(true)
            .map_err(|_| SyncError::ChannelError("Bridge shutdown channel closed".into()))?;

        if let Err(e) = self.webhook.shutdown().await {
            warn!(error = %e, "Webhook server already stopped");
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Bridge task panicked");
            }
        }

        info!("Bridge stopped");
        Ok(())
    }
}

// =============================================================================
// Engine Loop
// =============================================================================

struct EngineLoop {
    engine: SyncEngine,
    kinds: Vec<EntityKind>,
    batch: u32,
    poll_interval: Duration,
    wake: Arc<Notify>,
    refresh_rx: mpsc::Receiver<CanonicalId>,
    status: Arc<RwLock<SyncStatus>>,
}

impl EngineLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.poll_interval.as_secs(),
            kinds = self.kinds.len(),
            "Engine loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.engine.run_once(&self.kinds, self.batch).await;
                    self.record(result).await;
                }

                _ = self.wake.notified() => {
                    match self.engine.drain_inbox(self.batch).await {
                        Ok(report) => debug!(?report, "Inbox drained"),
                        Err(e) => error!(error = %e, "Inbox drain failed"),
                    }
                }

                Some(id) = self.refresh_rx.recv() => {
                    if let Err(e) = self.engine.refresh(id).await {
                        warn!(canonical_id = %id, error = %e, "Refresh failed");
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Engine loop stopped");
    }

    async fn record(&self, result: SyncResult<RunReport>) {
        let mut status = self.status.write().await;
        match result {
            Ok(report) => {
                if !report.is_idle() {
                    info!(?report, "Polling pass");
                }
                status.passes += 1;
                status.last_pass = Some(Utc::now());
                status.last_report = report;
                status.last_error = None;
            }
            Err(e) => {
                error!(error = %e, "Polling pass failed");
                status.last_error = Some(e.to_string());
            }
        }
    }
}
