//! Flush and apply span helpers.

use tracing::Span;

use crate::model::{MutationId, MutationType};

/// Start a span covering one flush pass.
///
/// The `flush.applied` and `flush.failed` fields are declared empty and
/// filled in by [`record_flush_outcome`].
pub fn start_flush_span(trigger: &str) -> Span {
    tracing::info_span!(
        "sync.flush",
        "flush.trigger" = trigger,
        "flush.applied" = tracing::field::Empty,
        "flush.failed" = tracing::field::Empty,
    )
}

/// Record the flush totals on a span created by [`start_flush_span`].
pub fn record_flush_outcome(span: &Span, applied: usize, failed: usize) {
    span.record("flush.applied", applied as u64);
    span.record("flush.failed", failed as u64);
}

/// Start a span for a single remote apply.
pub fn start_apply_span(mutation_type: MutationType, id: MutationId, attempt: u32) -> Span {
    tracing::info_span!(
        "sync.apply",
        "mutation.type" = mutation_type.as_str(),
        "mutation.id" = %id.0,
        "mutation.attempt" = attempt,
    )
}
