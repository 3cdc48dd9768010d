//! # fieldsync-rs
//!
//! Offline-first mutation queue and sync engine for field-service clients.
//!
//! User actions are recorded durably in a local queue, reflected immediately
//! in an optimistic read cache, and replayed against the system of record
//! whenever a flush trigger fires. Failures are classified, retried, and
//! eventually parked in a failure inbox for operator attention.

pub mod applier;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod inbox;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
