//! Sync engine: queue replay, single-flight guard, and flush triggers.

pub mod sync;
pub mod triggers;

pub use sync::{FlushObserver, FlushReport, LAST_SYNC_KEY, SyncEngine};
pub use triggers::{AppState, Triggers};
