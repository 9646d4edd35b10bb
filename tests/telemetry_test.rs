//! Integration tests for telemetry initialization and span helpers.

use std::time::Duration;

use chrono::Utc;
use docqueue::config::CollectionDefinition;
use docqueue::model::{ETag, ItemId, ItemStatus, QueueItem, Versioned};
use docqueue::store::WriteResponse;
use docqueue::telemetry;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "docqueue-test".to_string(),
        default_level: Some("debug".to_string()),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = telemetry::init_telemetry(config);
}

#[test]
fn item_span_records_transitions_and_outcome() {
    let span = telemetry::item::start_item_span("w1", &ItemId::from("a"), 2);
    telemetry::item::record_state_transition(&span, ItemStatus::Pending, ItemStatus::InProgress);
    telemetry::item::record_outcome(&span, "completed");
}

#[test]
fn store_span_records_write() {
    let collection = CollectionDefinition::new("db", "queue");
    let span = telemetry::store::start_store_span("claim", &collection);
    let response = WriteResponse {
        item: Versioned::new(
            QueueItem::new(ItemId::from("a"), serde_json::json!({}), Utc::now()),
            ETag::generate(),
        ),
        request_charge: 1.0,
        latency: Duration::from_millis(3),
    };
    telemetry::store::record_write(&span, "claim", &response);
}
