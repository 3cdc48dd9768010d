//! Durable mutation queue: enqueue with per-kind dedup, whole-blob persistence.
//!
//! Every read-modify-write of the queue blob goes through [`MutationQueue::update`],
//! which serializes writers on an async mutex. Nothing else touches the
//! store key directly.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::DurableStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "fieldsync.queue.v1";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    mutations: Vec<PendingMutation>,
}

/// Result of enqueueing a mutation.
#[derive(Debug)]
pub enum EnqueueResult {
    /// Appended to the end of the queue.
    Appended(PendingMutation),
    /// A field update that superseded earlier entries on the same dedup key.
    Replaced {
        mutation: PendingMutation,
        replaced: Vec<MutationId>,
    },
}

impl EnqueueResult {
    pub fn mutation(&self) -> &PendingMutation {
        match self {
            EnqueueResult::Appended(m) => m,
            EnqueueResult::Replaced { mutation, .. } => mutation,
        }
    }

    pub fn into_mutation(self) -> PendingMutation {
        match self {
            EnqueueResult::Appended(m) => m,
            EnqueueResult::Replaced { mutation, .. } => mutation,
        }
    }
}

/// Queue totals feeding the sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub failed: usize,
    /// Write generation the counts were taken at. Counts from an older
    /// generation never replace newer ones in the sync state.
    pub generation: u64,
}

impl QueueCounts {
    pub fn of(entries: &[PendingMutation]) -> Self {
        Self {
            pending: entries.len(),
            failed: entries.iter().filter(|m| m.is_failed()).count(),
            generation: 0,
        }
    }

    fn at(entries: &[PendingMutation], generation: u64) -> Self {
        Self {
            generation,
            ..Self::of(entries)
        }
    }
}

/// Ordered, durable list of pending mutations.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    key: String,
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_key(store, QUEUE_KEY)
    }

    /// Queue persisted under a custom key (several queues sharing one store).
    pub fn with_key(store: Arc<dyn DurableStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Record a mutation durably. Completes before the caller patches any
    /// local cache.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<EnqueueResult> {
        Ok(self.enqueue_counted(mutation).await?.0)
    }

    /// Like [`enqueue`](Self::enqueue), also returning the queue counts as
    /// of this write.
    pub async fn enqueue_counted(&self, mutation: Mutation) -> Result<(EnqueueResult, QueueCounts)> {
        let mutation_type = mutation.mutation_type();
        let pending = PendingMutation::new(mutation);
        let record = pending.clone();

        let (replaced, counts) = self
            .update(move |entries| {
                let mut replaced = Vec::new();
                if let Some(key) = record.mutation.dedup_key() {
                    entries.retain(|existing| {
                        let same = existing.mutation.dedup_key().as_ref() == Some(&key);
                        if same {
                            replaced.push(existing.id);
                        }
                        !same
                    });
                }
                entries.push(record);
                Ok(replaced)
            })
            .await?;

        let result_label = if replaced.is_empty() {
            "appended"
        } else {
            "replaced"
        };
        metrics::mutations_enqueued().add(
            1,
            &[
                KeyValue::new("type", mutation_type.as_str()),
                KeyValue::new("result", result_label),
            ],
        );
        debug!(
            id = %pending.id,
            mutation_type = %mutation_type,
            replaced = replaced.len(),
            "mutation enqueued"
        );

        let result = if replaced.is_empty() {
            EnqueueResult::Appended(pending)
        } else {
            EnqueueResult::Replaced {
                mutation: pending,
                replaced,
            }
        };
        Ok((result, counts))
    }

    /// Number of queued mutations, failed ones included.
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }

    /// Number of queued mutations carrying a `last_error`.
    pub async fn failed_count(&self) -> Result<usize> {
        Ok(QueueCounts::of(&self.load().await?).failed)
    }

    /// Counts read under the write lock, stamped with the current generation.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let _guard = self.write_lock.lock().await;
        let entries = self.load().await?;
        Ok(QueueCounts::at(
            &entries,
            self.generation.load(Ordering::SeqCst),
        ))
    }

    /// Entity ids targeted by queued mutations of one type. For field
    /// updates these are the dedup keys' entities.
    pub async fn pending_keys_of(&self, mutation_type: MutationType) -> Result<HashSet<String>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|m| m.mutation.mutation_type() == mutation_type)
            .map(|m| m.mutation.entity().id)
            .collect())
    }

    /// Look up one queued mutation.
    pub async fn get(&self, id: MutationId) -> Result<PendingMutation> {
        self.load()
            .await?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("mutation {id}")))
    }

    /// Read the whole queue in enqueue order.
    pub async fn load(&self) -> Result<Vec<PendingMutation>> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => Ok(snapshot.mutations),
            Err(e) => {
                // Keep the unreadable blob for inspection rather than
                // overwriting it on the next persist.
                let aside = format!("{}.corrupt", self.key);
                error!(key = %self.key, aside = %aside, error = %e, "queue snapshot unreadable, starting empty");
                self.store.set(&aside, raw).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Load, mutate in memory, and persist while holding the write lock.
    /// The only write path to the queue blob.
    ///
    /// Returns `f`'s output and the counts after the write. If `f` returns an
    /// error nothing is written.
    pub async fn update<F, T>(&self, f: F) -> Result<(T, QueueCounts)>
    where
        F: FnOnce(&mut Vec<PendingMutation>) -> Result<T>,
    {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let out = f(&mut entries)?;
        self.write(&entries).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((out, QueueCounts::at(&entries, generation)))
    }

    async fn write(&self, entries: &[PendingMutation]) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            mutations: entries.to_vec(),
        };
        let raw = serde_json::to_string(&snapshot)?;
        self.store.set(&self.key, raw).await?;
        if entries.is_empty() {
            info!(key = %self.key, "queue drained");
        }
        Ok(())
    }
}
