//! Sync state broadcaster.
//!
//! An explicitly constructed service shared via `Arc`. Only the sync engine
//! publishes; everyone else reads, subscribes, or watches.
//!
//! Publishes edit individual fields in place. Queue counts carry the write
//! generation they were read at and are dropped if a newer generation has
//! already been published.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::SyncState;
use crate::queue::QueueCounts;

type Listener = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// Handle returned by [`SyncStateBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct SyncStateBroadcaster {
    state: watch::Sender<SyncState>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
    counts_generation: AtomicU64,
}

impl Default for SyncStateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateBroadcaster {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            counts_generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Receiver for async consumers; sees every publish.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Register a listener called after every publish.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push((id, Arc::new(listener))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(listener))),
        }
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = match self.listeners.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Publish queue counts unless newer ones were already published.
    pub(crate) fn publish_counts(&self, counts: QueueCounts) {
        self.modify(Some(counts), |_| {});
    }

    pub(crate) fn set_syncing(&self, is_syncing: bool) {
        self.modify(None, |state| state.is_syncing = is_syncing);
    }

    pub(crate) fn set_last_sync(&self, last_sync_at: Option<DateTime<Utc>>) {
        self.modify(None, |state| state.last_sync_at = last_sync_at);
    }

    /// End of a flush: counts, sync time, and the syncing flag in one publish.
    pub(crate) fn finish_flush(&self, counts: QueueCounts, synced_at: DateTime<Utc>) {
        self.modify(Some(counts), |state| {
            state.last_sync_at = Some(synced_at);
            state.is_syncing = false;
        });
    }

    fn modify<F>(&self, counts: Option<QueueCounts>, f: F)
    where
        F: FnOnce(&mut SyncState),
    {
        self.state.send_modify(|state| {
            // send_modify holds the channel lock, so the generation check
            // and the count update are atomic.
            if let Some(counts) = counts {
                if counts.generation >= self.counts_generation.load(Ordering::SeqCst) {
                    self.counts_generation
                        .store(counts.generation, Ordering::SeqCst);
                    state.pending_count = counts.pending;
                    state.failed_count = counts.failed;
                } else {
                    debug!(generation = counts.generation, "dropping stale queue counts");
                }
            }
            f(state);
        });
        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        let snapshot = self.current();
        // Call listeners outside the lock so they may unsubscribe themselves.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(l) => l.iter().map(|(_, f)| Arc::clone(f)).collect(),
            Err(poisoned) => {
                warn!("sync state listener list poisoned");
                poisoned.into_inner().iter().map(|(_, f)| Arc::clone(f)).collect()
            }
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }
}
