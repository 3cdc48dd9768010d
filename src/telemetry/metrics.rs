//! Metric instrument factories for fieldsync-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"fieldsync-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("fieldsync-rs")
}

/// Counter: mutations enqueued.
/// Labels: `type`, `result` ("appended" | "replaced").
pub fn mutations_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("fieldsync.mutations.enqueued")
        .with_description("Number of mutations written to the queue")
        .build()
}

/// Counter: remote apply outcomes.
/// Labels: `type`, `result` ("ok" | "transient" | "permanent").
pub fn mutations_applied() -> Counter<u64> {
    meter()
        .u64_counter("fieldsync.mutations.applied")
        .with_description("Number of remote apply attempts by outcome")
        .build()
}

/// Counter: mutations parked into the failure inbox.
/// Labels: `type`, `reason` ("permanent" | "exhausted").
pub fn mutations_parked() -> Counter<u64> {
    meter()
        .u64_counter("fieldsync.mutations.parked")
        .with_description("Number of mutations parked for operator attention")
        .build()
}

/// Counter: flush invocations.
/// Labels: `result` ("ok" | "skipped" | "error").
pub fn flushes() -> Counter<u64> {
    meter()
        .u64_counter("fieldsync.flushes")
        .with_description("Number of flush invocations")
        .build()
}

/// Histogram: flush duration in milliseconds.
pub fn flush_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fieldsync.flush.duration_ms")
        .with_description("Flush duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: failure inbox actions.
/// Labels: `action` ("retry" | "dismiss"), `result`.
pub fn inbox_actions() -> Counter<u64> {
    meter()
        .u64_counter("fieldsync.inbox.actions")
        .with_description("Number of failure inbox actions")
        .build()
}
