//! Core data model.
//!
//! A pending mutation is a user action waiting to reach the system of record.
//! Its kind (a tagged variant) decides dedup behavior and routing.

pub mod mutation;
pub mod sync_state;

pub use mutation::*;
pub use sync_state::SyncState;
