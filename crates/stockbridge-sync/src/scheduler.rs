//! # Retry Scheduler
//!
//! Drives the operation outbox: claims due operations, delivers them through
//! the [`Executor`] and decides what happens after each attempt.
//!
//! ## Attempt Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  pending ──claim_due──► in_flight ──apply──┬── Applied ──confirm──┐     │
//! │     ▲                                      │                      │     │
//! │     │                                      │   Confirmed ─► delete│     │
//! │     │                                      │   Superseded ► delete│     │
//! │     │                                      │        + refresh request   │
//! │     │                                      │                            │
//! │     └── reschedule(now + backoff) ◄── Retryable (attempts < max)        │
//! │                                            │                            │
//! │          dead_letters ◄────────────────────┴── Rejected                 │
//! │                                               Retryable (attempts = max)│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! - One semaphore per platform bounds in-flight deliveries to it.
//! - Deliveries for one canonical entity are serialized by the shared
//!   entity locks, which the reconciler also takes.
//! - Rows left `in_flight` by a crash are returned to `pending` on start.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use stockbridge_core::{CanonicalId, Platform};
use stockbridge_db::{Database, KeyedLocks, QueuedOperation};

use crate::config::RetrySettings;
use crate::error::{SyncError, SyncResult};
use crate::executor::{ApplyOutcome, ConfirmOutcome, Executor};

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff with jitter, capped, with a bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Randomization factor in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            max_attempts: settings.max_attempts.max(1),
            jitter: settings.jitter,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: self.jitter,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Wait before the next try, after `attempts` failures.
    ///
    /// A platform `Retry-After` longer than the computed delay wins.
    pub fn delay_for(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        let mut backoff = self.backoff();
        let mut delay = self.base_delay;
        for _ in 0..attempts.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
        }
        let delay = delay.min(self.max_delay);

        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// =============================================================================
// Report
// =============================================================================

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub applied: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub superseded: usize,
    /// Deliveries that hit a store error and stay `in_flight` until restart.
    pub failed: usize,
}

impl DeliveryReport {
    pub fn total(&self) -> usize {
        self.applied + self.retried + self.dead_lettered + self.superseded + self.failed
    }

    fn record(&mut self, outcome: Delivery) {
        match outcome {
            Delivery::Applied => self.applied += 1,
            Delivery::Retried => self.retried += 1,
            Delivery::DeadLettered => self.dead_lettered += 1,
            Delivery::Superseded => self.superseded += 1,
        }
    }
}

enum Failure {
    Rejected(String),
    Retryable(String, Option<Duration>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Applied,
    Retried,
    DeadLettered,
    Superseded,
}

// =============================================================================
// Scheduler
// =============================================================================

struct Lane {
    executor: Executor,
    permits: Arc<Semaphore>,
}

/// Outbox driver. Cheap to clone; clones share lanes and locks.
#[derive(Clone)]
pub struct Scheduler {
    db: Database,

    /// One executor plus worker semaphore per platform.
    lanes: Arc<HashMap<Platform, Lane>>,

    policy: RetryPolicy,

    /// Shared with the reconciler. Must not be the store's own CAS lock set:
    /// confirm takes that one while this is held, and the same set would
    /// deadlock.
    locks: Arc<KeyedLocks<CanonicalId>>,

    /// Entities whose write was superseded and must be re-read.
    refresh_tx: Option<mpsc::Sender<CanonicalId>>,

    batch_size: u32,
}

impl Scheduler {
    /// `executors` pairs each platform's executor with its worker count.
    pub fn new(
        db: Database,
        executors: Vec<(Executor, usize)>,
        policy: RetryPolicy,
        locks: Arc<KeyedLocks<CanonicalId>>,
    ) -> Self {
        let lanes = executors
            .into_iter()
            .map(|(executor, workers)| {
                let lane = Lane {
                    permits: Arc::new(Semaphore::new(workers.max(1))),
                    executor,
                };
                (lane.executor.platform(), lane)
            })
            .collect();

        Scheduler {
            db,
            lanes: Arc::new(lanes),
            policy,
            locks,
            refresh_tx: None,
            batch_size: 100,
        }
    }

    pub fn with_refresh(mut self, tx: mpsc::Sender<CanonicalId>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claims and delivers every operation due at `now`, waiting for all.
    pub async fn process_due(&self, now: DateTime<Utc>) -> SyncResult<DeliveryReport> {
        let mut tasks = JoinSet::new();

        for platform in Platform::ALL {
            if !self.lanes.contains_key(&platform) {
                continue;
            }
            let due = self
                .db
                .operations()
                .claim_due(platform, now, self.batch_size)
                .await?;

            if !due.is_empty() {
                debug!(platform = %platform, count = due.len(), "Claimed due operations");
            }

            for queued in due {
                let this = self.clone();
                tasks.spawn(async move { this.deliver(queued, now).await });
            }
        }

        let mut report = DeliveryReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "Delivery bookkeeping failed");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Delivery task panicked");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn deliver(&self, queued: QueuedOperation, now: DateTime<Utc>) -> SyncResult<Delivery> {
        let op = &queued.operation;
        let lane = self
            .lanes
            .get(&op.target)
            .ok_or_else(|| SyncError::InvalidConfig(format!("no executor for {}", op.target)))?;

        let _permit = lane
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        let _guard = self.locks.lock(&op.canonical_id).await;

        let attempt = queued.attempts + 1;
        let failure = match lane.executor.apply(op).await {
            Ok(ApplyOutcome::Applied(applied)) => match lane.executor.confirm(op, &applied).await {
                Ok(ConfirmOutcome::Confirmed(_)) => {
                    self.db.operations().complete(queued.id).await?;
                    return Ok(Delivery::Applied);
                }
                Ok(ConfirmOutcome::Superseded { .. }) => {
                    self.db.operations().complete(queued.id).await?;
                    self.request_refresh(op.canonical_id);
                    return Ok(Delivery::Superseded);
                }
                Err(e) => Failure::Retryable(format!("confirm failed: {e}"), None),
            },
            Ok(ApplyOutcome::Superseded) => {
                self.db.operations().complete(queued.id).await?;
                self.request_refresh(op.canonical_id);
                return Ok(Delivery::Superseded);
            }
            Ok(ApplyOutcome::Rejected(reason)) => Failure::Rejected(reason),
            Ok(ApplyOutcome::Retryable { reason, retry_after }) => Failure::Retryable(reason, retry_after),
            Err(e) => Failure::Retryable(e.to_string(), None),
        };

        match failure {
            Failure::Rejected(reason) => {
                self.db
                    .operations()
                    .dead_letter(queued.id, &reason, attempt, now)
                    .await?;
                Ok(Delivery::DeadLettered)
            }
            Failure::Retryable(reason, _) if self.policy.is_exhausted(attempt) => {
                let reason = format!("gave up after {attempt} attempts: {reason}");
                self.db
                    .operations()
                    .dead_letter(queued.id, &reason, attempt, now)
                    .await?;
                Ok(Delivery::DeadLettered)
            }
            Failure::Retryable(reason, retry_after) => {
                let delay = self.policy.delay_for(attempt, retry_after);
                let next = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                warn!(
                    op_id = %queued.id,
                    canonical_id = %op.canonical_id,
                    target = %op.target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Delivery failed, rescheduling"
                );
                self.db
                    .operations()
                    .reschedule(queued.id, attempt, next, &reason, now)
                    .await?;
                Ok(Delivery::Retried)
            }
        }
    }

    fn request_refresh(&self, id: CanonicalId) {
        if let Some(tx) = &self.refresh_tx {
            if let Err(e) = tx.try_send(id) {
                warn!(canonical_id = %id, error = %e, "Refresh queue full, relying on next poll");
            }
        }
    }

    /// Ticks until `shutdown` flips to `true`. A pass in progress finishes
    /// first, so no delivery is cut off between apply and confirm.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> SyncResult<()> {
        self.db.operations().recover_in_flight().await?;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = interval.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.process_due(Utc::now()).await {
                        Ok(report) if report.total() > 0 => info!(?report, "Scheduler pass"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }
}
