//! Optimistic read cache.
//!
//! Entries are patched to the intended end state as soon as the user acts and
//! invalidated once the mutation behind the patch has been applied (or
//! dismissed), so the next read picks up authoritative server state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::engine::{FlushObserver, FlushReport};
use crate::error::Result;
use crate::model::MutationId;

/// Hierarchical cache key, e.g. `["checklist", "ticket-1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True if `prefix`'s segments lead this key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Loads authoritative state for a cache key.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<Value>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    stale: bool,
    fetched_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    pending: HashMap<MutationId, CacheKey>,
}

#[derive(Default)]
pub struct OptimisticCache {
    inner: Mutex<Inner>,
}

impl OptimisticCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cached value, stale or not.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// When the entry was last written, by fetch or by `set`.
    pub fn fetched_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.lock().entries.get(key).map(|e| e.fetched_at)
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.lock().entries.get(key).is_some_and(|e| e.stale)
    }

    pub fn set(&self, key: CacheKey, value: Value) {
        self.lock().entries.insert(
            key,
            Entry {
                value,
                stale: false,
                fetched_at: Utc::now(),
            },
        );
    }

    /// Apply an in-place edit to a cached value. Returns false, doing
    /// nothing, when the key is not cached.
    pub fn patch<F>(&self, key: &CacheKey, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        match self.lock().entries.get_mut(key) {
            Some(entry) => {
                f(&mut entry.value);
                true
            }
            None => false,
        }
    }

    /// Mark one entry stale; the next `get_or_fetch` refetches it.
    pub fn invalidate(&self, key: &CacheKey) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.stale = true;
        }
    }

    /// Mark every entry under `prefix` stale. Returns how many were marked.
    pub fn invalidate_prefix(&self, prefix: &CacheKey) -> usize {
        let mut inner = self.lock();
        let mut marked = 0;
        for (key, entry) in inner.entries.iter_mut() {
            if key.starts_with(prefix) {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

    /// Record that `key` reflects a not-yet-applied mutation.
    pub fn mark_pending(&self, id: MutationId, key: CacheKey) {
        self.lock().pending.insert(id, key);
    }

    /// Drop pending marks without invalidating (superseded mutations).
    pub fn forget_pending(&self, ids: &[MutationId]) {
        let mut inner = self.lock();
        for id in ids {
            inner.pending.remove(id);
        }
    }

    /// True while any queued mutation targets `key`.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock().pending.values().any(|k| k == key)
    }

    /// Return the cached value, fetching it when missing or stale.
    ///
    /// The fetch runs without holding the cache lock. Its result replaces
    /// whatever is cached at that point, optimistic patches included.
    pub async fn get_or_fetch(&self, key: &CacheKey, fetcher: &dyn Fetcher) -> Result<Value> {
        {
            let inner = self.lock();
            if let Some(entry) = inner.entries.get(key)
                && !entry.stale
            {
                return Ok(entry.value.clone());
            }
        }

        let value = fetcher.fetch(key).await?;
        debug!(key = %key, "cache refetched");
        self.set(key.clone(), value.clone());
        Ok(value)
    }
}

impl FlushObserver for OptimisticCache {
    fn flush_completed(&self, report: &FlushReport) {
        if report.applied.is_empty() && report.dismissed.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let mut touched = Vec::new();
        for id in report.applied.iter().chain(&report.dismissed) {
            if let Some(key) = inner.pending.remove(id) {
                touched.push(key);
            }
        }

        for key in touched {
            // Another queued mutation still backs this key.
            if inner.pending.values().any(|k| *k == key) {
                continue;
            }
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.stale = true;
                debug!(key = %key, "cache invalidated after sync");
            }
        }
    }
}
