//! Observable sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the sync subsystem as seen by UI surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Mutations still in the queue, failed ones included.
    pub pending_count: usize,
    /// Mutations carrying a `last_error`.
    pub failed_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_syncing: bool,
}
