//! Item processing span helpers.
//!
//! One `queue.item.process` span per dispatched item; status moves are
//! recorded as events inside it.

use tracing::Span;

use crate::model::{ItemId, ItemStatus};

/// Start a span for processing one claimed item.
///
/// The `docqueue.item.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_item_span(worker_id: &str, id: &ItemId, errors: u32) -> Span {
    tracing::info_span!(
        "queue.item.process",
        "docqueue.worker.id" = worker_id,
        "docqueue.item.id" = %id,
        "docqueue.item.errors" = errors,
        "docqueue.item.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: ItemStatus, to: ItemStatus) {
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("docqueue.item.outcome", outcome);
}
