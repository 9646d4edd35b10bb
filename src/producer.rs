//! Queue producer.
//!
//! Writes new Pending items. Producers never coordinate with each other;
//! every enqueue is an independent insert.

use std::sync::Arc;
use std::sync::OnceLock;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{Instrument, debug, info};

use crate::config::{CollectionDefinition, ProducerSettings};
use crate::error::{Error, Result};
use crate::model::{ItemId, QueueItem};
use crate::store::DocumentStore;
use crate::telemetry::metrics;
use crate::telemetry::store::{record_write, start_store_span};

pub struct QueueProducer {
    store: Arc<dyn DocumentStore>,
    collection: OnceLock<CollectionDefinition>,
}

impl QueueProducer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            collection: OnceLock::new(),
        }
    }

    /// Bind the producer to its queue collection, creating it if needed.
    /// Allowed exactly once.
    pub async fn initialize(&self, settings: ProducerSettings) -> Result<()> {
        if self.collection.get().is_some() {
            return Err(Error::Usage("producer already initialized".to_string()));
        }
        self.store
            .ensure_collection(&settings.queue_collection)
            .await?;

        let name = settings.queue_collection.qualified_name();
        self.collection
            .set(settings.queue_collection)
            .map_err(|_| Error::Usage("producer already initialized".to_string()))?;
        info!(collection = %name, "producer initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.collection.get().is_some()
    }

    /// Enqueue `data` under a freshly generated id.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, data: &T) -> Result<ItemId> {
        self.enqueue_with_id(ItemId::generate(), data).await
    }

    /// Enqueue `data` under a caller-chosen id. Fails with `AlreadyExists`
    /// if the id is taken.
    pub async fn enqueue_with_id<T: Serialize + ?Sized>(
        &self,
        id: impl Into<ItemId>,
        data: &T,
    ) -> Result<ItemId> {
        let collection = self.collection.get().ok_or_else(|| {
            Error::Usage("producer must be initialized before enqueueing".to_string())
        })?;

        let item = QueueItem::new(id.into(), serde_json::to_value(data)?, Utc::now());

        let span = start_store_span("create", collection);
        let created = self
            .store
            .create_item(collection, &item)
            .instrument(span.clone())
            .await;

        let result = match &created {
            Ok(_) => "ok",
            Err(Error::AlreadyExists { .. }) => "duplicate",
            Err(_) => "error",
        };
        metrics::items_enqueued().add(
            1,
            &[
                KeyValue::new("collection", collection.qualified_name()),
                KeyValue::new("result", result),
            ],
        );

        let response = created?;
        record_write(&span, "create", &response);
        debug!(id = %response.item.value.id, "item enqueued");
        Ok(response.item.value.id)
    }

    /// Release the producer. The store client is dropped with it.
    pub fn close(self) {
        if let Some(collection) = self.collection.get() {
            debug!(collection = %collection.qualified_name(), "producer closed");
        }
    }
}
