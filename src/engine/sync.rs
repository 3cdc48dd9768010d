//! Sync engine: replays the queue against the remote applier.
//!
//! One flush at a time. The flight guard is held for the whole
//! load → replay → merge cycle; overlapping callers return immediately.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, warn};

use crate::applier::{ApplyError, RemoteApplier};
use crate::broadcast::SyncStateBroadcaster;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::*;
use crate::queue::{MutationQueue, QueueCounts};
use crate::store::DurableStore;
use crate::telemetry::metrics;
use crate::telemetry::sync::{record_flush_outcome, start_apply_span, start_flush_span};
use opentelemetry::KeyValue;

/// Store key holding the RFC 3339 time of the last completed flush.
pub const LAST_SYNC_KEY: &str = "fieldsync.last_sync_at";

/// What a flush (or an inbox action) did to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Mutations handed to the applier.
    pub attempted: usize,
    /// Applied and removed from the queue.
    pub applied: Vec<MutationId>,
    /// Failed and kept with `last_error`.
    pub failed: Vec<MutationId>,
    /// Failed and parked by this pass.
    pub parked: Vec<MutationId>,
    /// Dropped without applying (failure inbox dismissals).
    pub dismissed: Vec<MutationId>,
    /// Another flush was in flight; nothing was done.
    pub skipped: bool,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Notified after every flush pass and inbox action that touched the queue.
pub trait FlushObserver: Send + Sync {
    fn flush_completed(&self, report: &FlushReport);
}

pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    store: Arc<dyn DurableStore>,
    applier: Arc<dyn RemoteApplier>,
    broadcaster: Arc<SyncStateBroadcaster>,
    config: EngineConfig,
    flight: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn FlushObserver>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        applier: Arc<dyn RemoteApplier>,
        broadcaster: Arc<SyncStateBroadcaster>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue: Arc::new(MutationQueue::new(Arc::clone(&store))),
            store,
            applier,
            broadcaster,
            config,
            flight: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn broadcaster(&self) -> &Arc<SyncStateBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.broadcaster.current()
    }

    pub fn add_observer(&self, observer: Arc<dyn FlushObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Restore the last sync time and publish initial counts.
    pub async fn init(&self) -> Result<SyncState> {
        let last_sync_at = match self.store.get(LAST_SYNC_KEY).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable last sync time");
                    None
                }
            },
            None => None,
        };
        let counts = self.queue.counts().await?;
        self.broadcaster.set_last_sync(last_sync_at);
        self.broadcaster.publish_counts(counts);
        Ok(self.state())
    }

    /// Recompute counts from the queue and publish them. Counts read before a
    /// newer queue write was published are dropped.
    pub async fn refresh_state(&self) -> Result<SyncState> {
        let counts = self.queue.counts().await?;
        self.broadcaster.publish_counts(counts);
        Ok(self.state())
    }

    /// Replay the queue once. Returns how many mutations were applied;
    /// 0 when another flush is already running.
    pub async fn flush(&self) -> Result<usize> {
        Ok(self.flush_with_report().await?.applied_count())
    }

    pub async fn flush_with_report(&self) -> Result<FlushReport> {
        self.flush_for("direct").await
    }

    pub(crate) async fn flush_for(&self, trigger: &'static str) -> Result<FlushReport> {
        let Ok(_flight) = self.flight.try_lock() else {
            debug!(trigger, "flush already in flight, skipping");
            metrics::flushes().add(1, &[KeyValue::new("result", "skipped")]);
            return Ok(FlushReport::skipped());
        };

        let span = start_flush_span(trigger);
        let started = Instant::now();
        self.broadcaster.set_syncing(true);

        match self.replay().instrument(span.clone()).await {
            Ok((report, counts)) => {
                record_flush_outcome(&span, report.applied.len(), report.failed.len());
                let synced_at = Utc::now();
                if let Err(e) = self.store.set(LAST_SYNC_KEY, synced_at.to_rfc3339()).await {
                    warn!(error = %e, "could not persist last sync time");
                }
                self.settle(&report, counts, Some(synced_at));

                let elapsed_ms = started.elapsed().as_millis() as u64;
                metrics::flushes().add(1, &[KeyValue::new("result", "ok")]);
                metrics::flush_duration_ms().record(elapsed_ms as f64, &[]);
                if report.attempted > 0 {
                    info!(
                        trigger,
                        applied = report.applied.len(),
                        failed = report.failed.len(),
                        parked = report.parked.len(),
                        remaining = counts.pending,
                        duration_ms = elapsed_ms,
                        "flush completed"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!(trigger, error = %e, "flush aborted by store failure");
                metrics::flushes().add(1, &[KeyValue::new("result", "error")]);
                self.broadcaster.set_syncing(false);
                Err(e)
            }
        }
    }

    /// One apply attempt per non-parked entry, then merge outcomes into the
    /// current queue by id.
    async fn replay(&self) -> Result<(FlushReport, QueueCounts)> {
        let batch = self.queue.load().await?;
        let mut report = FlushReport::default();
        let mut failures: Vec<(MutationId, ApplyError)> = Vec::new();

        for pending in batch.iter().filter(|m| !m.parked) {
            report.attempted += 1;
            match self.attempt(pending).await {
                Ok(()) => report.applied.push(pending.id),
                Err(e) => failures.push((pending.id, e)),
            }
        }

        if report.attempted == 0 {
            return Ok((report, self.queue.counts().await?));
        }

        let applied: HashSet<MutationId> = report.applied.iter().copied().collect();
        let max_attempts = self.config.max_attempts;
        let (parked, counts) = self
            .queue
            .update(|entries| {
                // Entries enqueued, replaced, or dismissed during the pass are
                // whatever the current snapshot says they are.
                entries.retain(|e| !applied.contains(&e.id));
                let mut parked = Vec::new();
                for (id, err) in &failures {
                    if let Some(entry) = entries.iter_mut().find(|e| e.id == *id)
                        && record_failure(entry, err, max_attempts)
                    {
                        parked.push(*id);
                    }
                }
                Ok(parked)
            })
            .await?;

        report.failed = failures.into_iter().map(|(id, _)| id).collect();
        report.parked = parked;
        Ok((report, counts))
    }

    /// Apply one mutation, bounded by the configured timeout.
    pub(crate) async fn attempt(
        &self,
        pending: &PendingMutation,
    ) -> std::result::Result<(), ApplyError> {
        let mutation_type = pending.mutation.mutation_type();
        let span = start_apply_span(mutation_type, pending.id, pending.attempts + 1);
        let timeout = self.config.apply_timeout;

        let outcome = match tokio::time::timeout(timeout, self.applier.apply(pending))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ApplyError::transient(format!(
                "apply timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };

        let label = match &outcome {
            Ok(()) => "ok",
            Err(e) if e.is_permanent() => "permanent",
            Err(_) => "transient",
        };
        metrics::mutations_applied().add(
            1,
            &[
                KeyValue::new("type", mutation_type.as_str()),
                KeyValue::new("result", label),
            ],
        );
        match &outcome {
            Ok(()) => debug!(id = %pending.id, %mutation_type, "mutation applied"),
            Err(e) => warn!(
                id = %pending.id,
                %mutation_type,
                error = %e,
                permanent = e.is_permanent(),
                "mutation apply failed"
            ),
        }
        outcome
    }

    /// Held by a flush; inbox retries wait on it.
    pub(crate) fn flight(&self) -> &Mutex<()> {
        &self.flight
    }

    /// Publish the post-operation counts and notify observers. `synced_at`
    /// marks the end of a flush and clears the syncing flag.
    pub(crate) fn settle(
        &self,
        report: &FlushReport,
        counts: QueueCounts,
        synced_at: Option<DateTime<Utc>>,
    ) {
        match synced_at {
            Some(synced_at) => self.broadcaster.finish_flush(counts, synced_at),
            None => self.broadcaster.publish_counts(counts),
        }

        let observers: Vec<Arc<dyn FlushObserver>> = match self.observers.read() {
            Ok(o) => o.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer.flush_completed(report);
        }
    }
}

/// Record a failed attempt on a queue entry. Returns true if this failure
/// parked it.
pub(crate) fn record_failure(entry: &mut PendingMutation, err: &ApplyError, max_attempts: u32) -> bool {
    entry.attempts += 1;
    entry.last_error = Some(err.message.clone());
    if entry.parked {
        return false;
    }

    let reason = if err.is_permanent() {
        "permanent"
    } else if entry.attempts >= max_attempts {
        "exhausted"
    } else {
        return false;
    };

    entry.parked = true;
    metrics::mutations_parked().add(
        1,
        &[
            KeyValue::new("type", entry.mutation.mutation_type().as_str()),
            KeyValue::new("reason", reason),
        ],
    );
    warn!(
        id = %entry.id,
        attempts = entry.attempts,
        reason,
        "mutation parked in failure inbox"
    );
    true
}
