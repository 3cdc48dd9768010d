//! Sync client: the entry point screens use to record user actions.
//!
//! Wires the queue, engine, broadcaster, cache, triggers, and failure inbox
//! together and runs the user-action sequence: durable enqueue, optimistic
//! cache patch, pending mark, then a best-effort background flush.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::applier::RemoteApplier;
use crate::broadcast::SyncStateBroadcaster;
use crate::cache::{CacheKey, OptimisticCache};
use crate::config::EngineConfig;
use crate::engine::{SyncEngine, Triggers};
use crate::error::Result;
use crate::inbox::FailureInbox;
use crate::model::*;
use crate::queue::EnqueueResult;
use crate::store::DurableStore;

type Patch = Box<dyn FnOnce(&mut Value) + Send>;

/// A user action: the mutation to queue plus the cache entry it changes.
pub struct UserAction {
    pub mutation: Mutation,
    pub cache_key: Option<CacheKey>,
    patch: Option<Patch>,
}

impl UserAction {
    pub fn new(mutation: Mutation) -> Self {
        Self {
            mutation,
            cache_key: None,
            patch: None,
        }
    }

    /// Cache entry this action affects. Marked pending until applied.
    pub fn cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    /// Edit bringing the cached value to the action's intended end state.
    pub fn patch<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Value) + Send + 'static,
    {
        self.patch = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAction")
            .field("mutation", &self.mutation)
            .field("cache_key", &self.cache_key)
            .field("patch", &self.patch.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct SyncClient {
    engine: Arc<SyncEngine>,
    cache: Arc<OptimisticCache>,
    triggers: Triggers,
    inbox: FailureInbox,
}

impl SyncClient {
    /// Build the components over `store` and publish the restored state.
    pub async fn open(
        store: Arc<dyn DurableStore>,
        applier: Arc<dyn RemoteApplier>,
        config: EngineConfig,
    ) -> Result<Self> {
        let broadcaster = Arc::new(SyncStateBroadcaster::new());
        let engine = Arc::new(SyncEngine::new(store, applier, broadcaster, config));
        let cache = Arc::new(OptimisticCache::new());
        engine.add_observer(cache.clone());
        engine.init().await?;

        Ok(Self {
            triggers: Triggers::new(Arc::clone(&engine)),
            inbox: FailureInbox::new(Arc::clone(&engine)),
            engine,
            cache,
        })
    }

    /// Record a user action.
    ///
    /// Returns once the mutation is durable. If enqueueing fails the cache is
    /// left untouched and the error is returned.
    pub async fn record(&self, action: UserAction) -> Result<PendingMutation> {
        let UserAction {
            mutation,
            cache_key,
            patch,
        } = action;

        let (enqueued, counts) = self.engine.queue().enqueue_counted(mutation).await?;
        let replaced = match &enqueued {
            EnqueueResult::Replaced { replaced, .. } => replaced.clone(),
            EnqueueResult::Appended(_) => Vec::new(),
        };
        let pending = enqueued.into_mutation();

        if let Some(key) = cache_key {
            if let Some(patch) = patch {
                self.cache.patch(&key, patch);
            }
            self.cache.forget_pending(&replaced);
            self.cache.mark_pending(pending.id, key);
        }

        // Counts from the enqueue's own write; a flush that lands later wins.
        self.engine.broadcaster().publish_counts(counts);
        debug!(id = %pending.id, pending = counts.pending, "user action recorded");

        // Detached; the single-flight guard absorbs overlap.
        drop(self.triggers.after_enqueue());
        Ok(pending)
    }

    /// Manual flush; the count of mutations applied.
    pub async fn sync_now(&self) -> usize {
        self.triggers.sync_now().await
    }

    /// Entity ids with queued mutations of one type, for pending badges.
    pub async fn pending_keys_of(&self, mutation_type: MutationType) -> Result<HashSet<String>> {
        self.engine.queue().pending_keys_of(mutation_type).await
    }

    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn broadcaster(&self) -> &Arc<SyncStateBroadcaster> {
        self.engine.broadcaster()
    }

    pub fn cache(&self) -> &Arc<OptimisticCache> {
        &self.cache
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn inbox(&self) -> &FailureInbox {
        &self.inbox
    }
}
