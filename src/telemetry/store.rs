//! Store request span helpers.
//!
//! Uses OpenTelemetry database semantic conventions where they fit:
//! - `db.operation.name`
//! - `db.namespace`
//! - `db.collection.name`
//!
//! Request charge and latency are recorded once the write returns.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::config::CollectionDefinition;
use crate::store::WriteResponse;

/// Start a span for one store request.
///
/// The charge and latency fields are declared empty and filled by
/// [`record_write`].
pub fn start_store_span(operation: &str, collection: &CollectionDefinition) -> Span {
    tracing::debug_span!(
        "docqueue.store",
        "db.operation.name" = operation,
        "db.namespace" = collection.db_name.as_str(),
        "db.collection.name" = collection.collection_name.as_str(),
        "docqueue.request_charge" = tracing::field::Empty,
        "docqueue.latency_ms" = tracing::field::Empty,
    )
}

/// Record a completed write on the span and on the store histograms.
pub fn record_write(span: &Span, operation: &str, response: &WriteResponse) {
    let latency_ms = response.latency.as_secs_f64() * 1000.0;
    span.record("docqueue.request_charge", response.request_charge);
    span.record("docqueue.latency_ms", latency_ms);

    let labels = [KeyValue::new("operation", operation.to_string())];
    metrics::store_request_charge().record(response.request_charge, &labels);
    metrics::operation_duration_ms().record(latency_ms, &labels);

    span.in_scope(|| {
        tracing::trace!(
            id = %response.item.value.id,
            latency_ms,
            request_charge = response.request_charge,
            "{operation} written"
        );
    });
}
