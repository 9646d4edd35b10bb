//! Metric instrument factories for docqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"docqueue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for docqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("docqueue")
}

/// Counter: items written by producers.
/// Labels: `collection`, `result` ("ok" | "duplicate" | "error").
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.items.enqueued")
        .with_description("Number of queue items enqueued")
        .build()
}

/// Counter: conditional claim writes.
/// Labels: `worker`, `result` ("acquired" | "conflict" | "error").
pub fn claim_attempts() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.claim.attempts")
        .with_description("Number of claim attempts by result")
        .build()
}

/// Counter: how dispatched items were resolved.
/// Labels: `worker`, `outcome` ("completed" | "rejected" | "failed" | "manual").
pub fn item_resolutions() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.item.resolutions")
        .with_description("Number of dispatched items by outcome")
        .build()
}

/// Counter: expired claims returned to Pending by the reclaim sweep.
/// Labels: `worker`.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.leases.reclaimed")
        .with_description("Number of expired claims returned to pending")
        .build()
}

/// Histogram: store-reported request charge per write.
/// Labels: `operation`.
pub fn store_request_charge() -> Histogram<f64> {
    meter()
        .f64_histogram("docqueue.store.request_charge")
        .with_description("Store request charge per write")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("docqueue.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
