//! Shared fixtures: scripted appliers and mutation builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use fieldsync_rs::applier::{ApplyError, RemoteApplier};
use fieldsync_rs::broadcast::SyncStateBroadcaster;
use fieldsync_rs::config::EngineConfig;
use fieldsync_rs::engine::SyncEngine;
use fieldsync_rs::model::*;
use fieldsync_rs::store::{DurableStore, MemoryStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

// ---------------------------------------------------------------------------
// Scripted applier
// ---------------------------------------------------------------------------

/// Records every apply call. Succeeds unless scripted otherwise, per entity id.
#[derive(Default)]
pub struct ScriptedApplier {
    calls: Mutex<Vec<PendingMutation>>,
    failures: Mutex<HashMap<String, VecDeque<ApplyError>>>,
    rejected: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl ScriptedApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` applies for `entity_id` with a transient error.
    pub fn fail_next(&self, entity_id: &str, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(entity_id.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(ApplyError::transient("HTTP 503"));
        }
    }

    /// Reject every apply for `entity_id` permanently until `accept` is called.
    pub fn reject(&self, entity_id: &str) {
        self.rejected.lock().unwrap().insert(entity_id.to_string());
    }

    pub fn accept(&self, entity_id: &str) {
        self.rejected.lock().unwrap().remove(entity_id);
    }

    /// Fail everything transiently, as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PendingMutation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls that targeted one entity, in order.
    pub fn calls_for(&self, entity_id: &str) -> Vec<Mutation> {
        self.calls()
            .into_iter()
            .map(|p| p.mutation)
            .filter(|m| m.entity().id == entity_id)
            .collect()
    }

    fn outcome(&self, pending: &PendingMutation) -> Result<(), ApplyError> {
        self.calls.lock().unwrap().push(pending.clone());
        let entity = pending.mutation.entity().id;

        if self.offline.load(Ordering::SeqCst) {
            return Err(ApplyError::transient("network unreachable"));
        }
        if self.rejected.lock().unwrap().contains(&entity) {
            return Err(ApplyError::permanent("HTTP 422: entity rejected"));
        }
        match self.failures.lock().unwrap().get_mut(&entity) {
            Some(queue) => match queue.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApplier for ScriptedApplier {
    async fn apply(&self, pending: &PendingMutation) -> Result<(), ApplyError> {
        self.outcome(pending)
    }
}

// ---------------------------------------------------------------------------
// Gated applier
// ---------------------------------------------------------------------------

/// Blocks each apply until the test releases a permit. `entered` fires as
/// each apply starts waiting.
pub struct GatedApplier {
    pub inner: Arc<ScriptedApplier>,
    pub entered: Notify,
    gate: Semaphore,
}

impl GatedApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ScriptedApplier::new(),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        })
    }

    /// Let `n` blocked (or future) applies proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl RemoteApplier for GatedApplier {
    async fn apply(&self, pending: &PendingMutation) -> Result<(), ApplyError> {
        self.entered.notify_one();
        self.gate.acquire().await.unwrap().forget();
        self.inner.apply(pending).await
    }
}

// ---------------------------------------------------------------------------
// Holding store
// ---------------------------------------------------------------------------

/// In-memory store whose next `get` after `arm()` blocks until `release()`.
/// `held` fires once that read is waiting.
pub struct HoldingStore {
    inner: MemoryStore,
    armed: AtomicBool,
    pub held: Notify,
    gate: Semaphore,
}

impl HoldingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
            held: Notify::new(),
            gate: Semaphore::new(0),
        })
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl DurableStore for HoldingStore {
    async fn get(&self, key: &str) -> fieldsync_rs::error::Result<Option<String>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> fieldsync_rs::error::Result<()> {
        self.inner.set(key, value).await
    }
}

// ---------------------------------------------------------------------------
// Engine construction
// ---------------------------------------------------------------------------

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_attempts: 3,
        apply_timeout: Duration::from_secs(5),
    }
}

pub fn engine_with(
    store: Arc<dyn DurableStore>,
    applier: Arc<dyn RemoteApplier>,
) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(
        store,
        applier,
        Arc::new(SyncStateBroadcaster::new()),
        test_config(),
    ))
}

pub fn memory_engine(applier: Arc<dyn RemoteApplier>) -> Arc<SyncEngine> {
    engine_with(Arc::new(MemoryStore::new()), applier)
}

// ---------------------------------------------------------------------------
// Mutation builders
// ---------------------------------------------------------------------------

pub fn toggle(item: &str, checked: bool) -> Mutation {
    Mutation::ChecklistToggle {
        checklist_item_id: item.to_string(),
        is_checked: checked,
    }
}

pub fn score(item: &str, score: i32) -> Mutation {
    Mutation::InspectionScore {
        inspection_item_id: item.to_string(),
        score,
        notes: None,
        photo_taken: false,
    }
}

pub fn time_event(staff: &str, event_type: TimeEventType) -> Mutation {
    Mutation::TimeEvent {
        staff_id: staff.to_string(),
        ticket_id: Some("ticket-1".to_string()),
        event_type,
        recorded_at: Utc::now(),
        location: None,
    }
}

pub fn ticket_status(ticket: &str, status: &str) -> Mutation {
    Mutation::TicketStatus {
        ticket_id: ticket.to_string(),
        status: status.to_string(),
        client_version: Some(1),
    }
}
