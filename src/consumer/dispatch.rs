//! Handler invocation and outcome-driven resolution.
//!
//! Every resolution write presents the token from the claim (or from the
//! previous resolution) so a claim that was reclaimed underneath the handler
//! cannot be overwritten.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{Instrument, Span, error, info, warn};

use super::handler::{HandlerOutcome, MessageHandler};
use crate::config::CollectionDefinition;
use crate::error::{Error, Result};
use crate::model::{ItemId, ItemStatus, QueueItem, Versioned};
use crate::store::DocumentStore;
use crate::telemetry::item::{record_outcome, record_state_transition, start_item_span};
use crate::telemetry::metrics;
use crate::telemetry::store::{record_write, start_store_span};

// ---------------------------------------------------------------------------
// ReceivedItem
// ---------------------------------------------------------------------------

/// A claimed item as handed to a [`MessageHandler`].
///
/// Cheap to clone. `complete` and `abandon` let the handler resolve the item
/// itself; with auto-complete disabled they are the only way out of
/// InProgress short of an exception or lease expiry.
#[derive(Clone)]
pub struct ReceivedItem {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    collection: CollectionDefinition,
    span: Span,
    id: ItemId,
    data: serde_json::Value,
    errors: u32,
    current: Mutex<Versioned<QueueItem>>,
}

impl ReceivedItem {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        collection: CollectionDefinition,
        claimed: Versioned<QueueItem>,
        span: Span,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                collection,
                span,
                id: claimed.value.id.clone(),
                data: claimed.value.data.clone(),
                errors: claimed.value.errors,
                current: Mutex::new(claimed),
            }),
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.inner.id
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.inner.data
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.inner.data.clone())?)
    }

    /// Failed attempts recorded before this delivery.
    pub fn errors(&self) -> u32 {
        self.inner.errors
    }

    pub async fn status(&self) -> ItemStatus {
        self.inner.current.lock().await.value.status
    }

    /// Mark the item Completed and persist it.
    pub async fn complete(&self) -> Result<()> {
        self.resolve("complete", |item| item.mark_completed(Utc::now()))
            .await
    }

    /// Return the item to Pending (counting a failed attempt) and persist it.
    pub async fn abandon(&self) -> Result<()> {
        self.resolve("abandon", QueueItem::mark_returned_to_pending)
            .await
    }

    async fn resolve(
        &self,
        operation: &str,
        mutate: impl FnOnce(&mut QueueItem) -> Result<()>,
    ) -> Result<()> {
        let mut current = self.inner.current.lock().await;
        let mut next = current.value.clone();
        let from = next.status;
        mutate(&mut next)?;

        let span = start_store_span(operation, &self.inner.collection);
        let response = self
            .inner
            .store
            .upsert_item(&self.inner.collection, &next, Some(&current.etag))
            .instrument(span.clone())
            .await?;
        record_write(&span, operation, &response);
        record_state_transition(&self.inner.span, from, next.status);

        *current = response.item;
        Ok(())
    }
}

impl std::fmt::Debug for ReceivedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedItem")
            .field("id", &self.inner.id)
            .field("errors", &self.inner.errors)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// How a dispatched item left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handler succeeded and the item was persisted as Completed.
    Completed,
    /// Handler rejected the item; persisted back to Pending.
    Rejected,
    /// Handler raised or panicked; the item was returned to Pending.
    Failed,
    /// Left to the handler (manual mode, or the handler resolved it itself).
    Manual,
    /// The resolution write did not land; the durable item is unchanged.
    Unpersisted,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Rejected => "rejected",
            Resolution::Failed => "failed",
            Resolution::Manual => "manual",
            Resolution::Unpersisted => "unpersisted",
        }
    }
}

/// Invokes the handler for claimed items and applies the outcome.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub store: Arc<dyn DocumentStore>,
    pub handler: Arc<dyn MessageHandler>,
    pub collection: CollectionDefinition,
    pub worker_id: String,
    pub auto_complete: bool,
}

impl Dispatcher {
    /// Run the handler for one claimed item and resolve it.
    pub async fn dispatch(&self, claimed: Versioned<QueueItem>) -> Resolution {
        let span = start_item_span(&self.worker_id, &claimed.value.id, claimed.value.errors);
        record_state_transition(&span, ItemStatus::Pending, ItemStatus::InProgress);

        let item = ReceivedItem::new(
            Arc::clone(&self.store),
            self.collection.clone(),
            claimed,
            span.clone(),
        );
        let resolution = self.run(item).instrument(span.clone()).await;

        record_outcome(&span, resolution.as_str());
        metrics::item_resolutions().add(
            1,
            &[
                KeyValue::new("worker", self.worker_id.clone()),
                KeyValue::new("outcome", resolution.as_str()),
            ],
        );
        resolution
    }

    async fn run(&self, item: ReceivedItem) -> Resolution {
        let invoked = AssertUnwindSafe(self.handler.handle(item.clone()))
            .catch_unwind()
            .await;

        match invoked {
            Ok(Ok(outcome)) if self.auto_complete => self.auto_resolve(&item, outcome).await,
            Ok(Ok(_)) => Resolution::Manual,
            Ok(Err(e)) => self.resolve_exception(&item, &format!("{e:#}")).await,
            Err(panic) => self.resolve_exception(&item, &panic_message(panic.as_ref())).await,
        }
    }

    async fn auto_resolve(&self, item: &ReceivedItem, outcome: HandlerOutcome) -> Resolution {
        if item.status().await != ItemStatus::InProgress {
            // resolved by the handler
            return Resolution::Manual;
        }

        match outcome {
            HandlerOutcome::Success => match item.complete().await {
                Ok(()) => {
                    info!(id = %item.id(), "item completed");
                    Resolution::Completed
                }
                Err(e) => unpersisted(item, &e),
            },
            HandlerOutcome::Rejected => {
                warn!(
                    id = %item.id(),
                    errors = item.errors() + 1,
                    "handler rejected item, returning to pending"
                );
                match item.abandon().await {
                    Ok(()) => Resolution::Rejected,
                    Err(e) => unpersisted(item, &e),
                }
            }
        }
    }

    /// An exception always returns the item to Pending, auto-complete or not.
    async fn resolve_exception(&self, item: &ReceivedItem, message: &str) -> Resolution {
        error!(id = %item.id(), "{}", Error::Handler(message.to_string()));

        match item.status().await {
            ItemStatus::InProgress => match item.abandon().await {
                Ok(()) => Resolution::Failed,
                Err(e) => unpersisted(item, &e),
            },
            // already abandoned by the handler before it raised
            ItemStatus::Pending => Resolution::Failed,
            ItemStatus::Completed => {
                error!(
                    id = %item.id(),
                    "handler raised after completing the item, leaving it completed"
                );
                Resolution::Failed
            }
        }
    }
}

fn unpersisted(item: &ReceivedItem, e: &Error) -> Resolution {
    if e.is_precondition_failed() {
        warn!(
            id = %item.id(),
            "item changed while it was being processed, resolution dropped"
        );
    } else {
        error!(id = %item.id(), "failed to persist resolution: {e}");
    }
    Resolution::Unpersisted
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
