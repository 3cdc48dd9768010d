//! Integration tests for flush: replay order, failure handling, single-flight.

mod common;

use common::*;
use fieldsync_rs::engine::LAST_SYNC_KEY;
use fieldsync_rs::model::*;
use fieldsync_rs::store::{DurableStore, MemoryStore};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deduped_field_updates_apply_latest_value_once() {
    let applier = ScriptedApplier::new();
    let engine = memory_engine(applier.clone());
    let queue = engine.queue();

    queue.enqueue(toggle("key-a", true)).await.unwrap();
    queue.enqueue(toggle("key-b", true)).await.unwrap();
    queue.enqueue(toggle("key-a", false)).await.unwrap();
    engine.refresh_state().await.unwrap();
    assert_eq!(engine.state().pending_count, 2);

    let applied = engine.flush().await.unwrap();

    assert_eq!(applied, 2);
    assert_eq!(engine.state().pending_count, 0);
    assert_eq!(applier.call_count(), 2);
    assert_eq!(applier.calls_for("key-a"), vec![toggle("key-a", false)]);
}

#[tokio::test]
async fn append_only_events_replay_in_enqueue_order() {
    let applier = ScriptedApplier::new();
    let engine = memory_engine(applier.clone());

    let order = [
        TimeEventType::CheckIn,
        TimeEventType::BreakStart,
        TimeEventType::BreakEnd,
        TimeEventType::CheckOut,
    ];
    for event_type in order {
        engine
            .queue()
            .enqueue(time_event("staff-1", event_type))
            .await
            .unwrap();
    }

    engine.flush().await.unwrap();

    let replayed: Vec<TimeEventType> = applier
        .calls_for("staff-1")
        .into_iter()
        .map(|m| match m {
            Mutation::TimeEvent { event_type, .. } => event_type,
            other => panic!("unexpected mutation {other:?}"),
        })
        .collect();
    assert_eq!(replayed, order);
}

#[tokio::test]
async fn flush_on_empty_queue_applies_nothing_and_stamps_last_sync() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), ScriptedApplier::new());

    assert_eq!(engine.flush().await.unwrap(), 0);

    let state = engine.state();
    assert!(state.last_sync_at.is_some());
    assert!(!state.is_syncing);
    assert!(store.get(LAST_SYNC_KEY).await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_event_stays_queued_then_succeeds() {
    let applier = ScriptedApplier::new();
    applier.fail_next("staff-1", 1);
    let engine = memory_engine(applier.clone());

    engine
        .queue()
        .enqueue(time_event("staff-1", TimeEventType::CheckIn))
        .await
        .unwrap();

    assert_eq!(engine.flush().await.unwrap(), 0);
    let state = engine.state();
    assert_eq!(state.pending_count, 1);
    assert_eq!(state.failed_count, 1);

    let entry = &engine.queue().load().await.unwrap()[0];
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));
    assert!(!entry.parked);

    assert_eq!(engine.flush().await.unwrap(), 1);
    let state = engine.state();
    assert_eq!(state.pending_count, 0);
    assert_eq!(state.failed_count, 0);
}

#[tokio::test]
async fn one_failure_does_not_block_the_rest() {
    let applier = ScriptedApplier::new();
    applier.fail_next("c-2", 1);
    let engine = memory_engine(applier.clone());

    for item in ["c-1", "c-2", "c-3"] {
        engine.queue().enqueue(toggle(item, true)).await.unwrap();
    }

    let report = engine.flush_with_report().await.unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.failed.len(), 1);

    let remaining = engine.queue().load().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].mutation, toggle("c-2", true));
}

#[tokio::test]
async fn permanent_rejection_parks_and_later_flushes_skip_it() {
    let applier = ScriptedApplier::new();
    applier.reject("t-gone");
    let engine = memory_engine(applier.clone());

    engine
        .queue()
        .enqueue(ticket_status("t-gone", "COMPLETED"))
        .await
        .unwrap();

    let report = engine.flush_with_report().await.unwrap();
    assert_eq!(report.parked.len(), 1);
    assert_eq!(applier.call_count(), 1);

    let report = engine.flush_with_report().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(applier.call_count(), 1);

    let state = engine.state();
    assert_eq!(state.pending_count, 1);
    assert_eq!(state.failed_count, 1);
}

#[tokio::test]
async fn transient_failures_park_after_max_attempts() {
    let applier = ScriptedApplier::new();
    applier.set_offline(true);
    let engine = memory_engine(applier.clone());
    let max = engine.config().max_attempts;

    engine.queue().enqueue(toggle("c-1", true)).await.unwrap();

    for _ in 0..max {
        engine.flush().await.unwrap();
    }
    let entry = &engine.queue().load().await.unwrap()[0];
    assert!(entry.parked);
    assert_eq!(entry.attempts, max);

    // Back online, but parked entries wait for the inbox.
    applier.set_offline(false);
    assert_eq!(engine.flush().await.unwrap(), 0);
    assert_eq!(applier.call_count(), max as usize);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overlapping_flush_is_a_no_op() {
    let gated = GatedApplier::new();
    let engine = memory_engine(gated.clone());
    engine.queue().enqueue(toggle("c-1", true)).await.unwrap();

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.flush().await.unwrap() }
    });
    gated.entered.notified().await;
    assert!(engine.state().is_syncing);

    let second = engine.flush_with_report().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.applied_count(), 0);

    gated.release(1);
    assert_eq!(first.await.unwrap(), 1);
    assert_eq!(gated.inner.call_count(), 1);
    assert!(!engine.state().is_syncing);
}

#[tokio::test]
async fn mutation_enqueued_during_flush_survives() {
    let gated = GatedApplier::new();
    let engine = memory_engine(gated.clone());
    engine.queue().enqueue(toggle("c-1", true)).await.unwrap();

    let flush = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.flush().await.unwrap() }
    });
    gated.entered.notified().await;

    let late = engine
        .queue()
        .enqueue(time_event("staff-1", TimeEventType::CheckIn))
        .await
        .unwrap()
        .into_mutation();

    gated.release(1);
    assert_eq!(flush.await.unwrap(), 1);

    let remaining = engine.queue().load().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, late.id);
    assert_eq!(engine.state().pending_count, 1);
}

#[tokio::test]
async fn field_update_replaced_during_flush_keeps_new_value() {
    let gated = GatedApplier::new();
    let engine = memory_engine(gated.clone());
    engine.queue().enqueue(score("i-1", 2)).await.unwrap();

    let flush = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.flush().await.unwrap() }
    });
    gated.entered.notified().await;

    engine.queue().enqueue(score("i-1", 5)).await.unwrap();
    gated.release(1);
    flush.await.unwrap();

    // The in-flight value was applied; the newer one is still queued.
    let remaining = engine.queue().load().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].mutation, score("i-1", 5));
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[tokio::test]
async fn init_restores_counts_and_last_sync_after_restart() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let applier = ScriptedApplier::new();
    applier.fail_next("c-1", 1);

    {
        let engine = engine_with(Arc::clone(&store), applier.clone());
        engine.queue().enqueue(toggle("c-1", true)).await.unwrap();
        engine.queue().enqueue(toggle("c-2", true)).await.unwrap();
        engine.flush().await.unwrap();
    }

    let engine = engine_with(store, applier);
    let state = engine.init().await.unwrap();
    assert_eq!(state.pending_count, 1);
    assert_eq!(state.failed_count, 1);
    assert!(state.last_sync_at.is_some());
    assert!(!state.is_syncing);
}

#[tokio::test]
async fn subscribers_see_syncing_toggle() {
    let engine = memory_engine(ScriptedApplier::new());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    engine.broadcaster().subscribe(move |state| {
        log.lock().unwrap().push(state.is_syncing);
    });

    engine.flush().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn refresh_racing_a_flush_does_not_publish_old_counts() {
    let store = HoldingStore::new();
    let engine = engine_with(store.clone(), ScriptedApplier::new());
    engine.queue().enqueue(toggle("c-1", true)).await.unwrap();

    // The refresh reads the queue and stalls before publishing.
    store.arm();
    let refresh = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.refresh_state().await.unwrap() }
    });
    store.held.notified().await;

    let flush = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.flush().await.unwrap() }
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    store.release();
    refresh.await.unwrap();
    assert_eq!(flush.await.unwrap(), 1);

    assert_eq!(engine.queue().pending_count().await.unwrap(), 0);
    assert_eq!(engine.state().pending_count, 0);
}

#[tokio::test]
async fn refresh_during_flush_keeps_syncing_flag() {
    let gated = GatedApplier::new();
    let engine = memory_engine(gated.clone());
    engine.queue().enqueue(toggle("c-1", true)).await.unwrap();

    let flush = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.flush().await.unwrap() }
    });
    gated.entered.notified().await;

    let state = engine.refresh_state().await.unwrap();
    assert!(state.is_syncing);
    assert_eq!(state.pending_count, 1);

    gated.release(1);
    assert_eq!(flush.await.unwrap(), 1);
    let state = engine.state();
    assert!(!state.is_syncing);
    assert_eq!(state.pending_count, 0);
}
