//! Remote applier: the system-of-record endpoint that accepts mutations.
//!
//! Implementations must be idempotent for field updates and state
//! transitions, since a mutation whose success response was lost is
//! applied again on the next flush.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::PendingMutation;

pub use http::HttpApplier;

/// Whether a failed apply is worth retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network unreachable, timeout, server-side trouble.
    Transient,
    /// Validation, missing entity, unresolved precondition.
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub kind: FailureKind,
    pub message: String,
}

impl ApplyError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }
}

/// Applies one mutation to the system of record, dispatching by kind.
///
/// The whole queue record is passed so an applier can use the mutation id
/// as an idempotency key; the payload is `pending.mutation`.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    async fn apply(&self, pending: &PendingMutation) -> Result<(), ApplyError>;
}
