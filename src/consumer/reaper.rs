//! Expired-lease sweep.
//!
//! A worker that dies mid-processing leaves its items InProgress. The sweep
//! finds claims whose `workerExpires` has passed and returns them to Pending
//! with a conditional write, counting the lost attempt as an error. The write
//! re-enters the change feed, so the item gets claimed again normally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::config::CollectionDefinition;
use crate::error::Result;
use crate::model::Versioned;
use crate::store::DocumentStore;
use crate::telemetry::metrics;
use crate::telemetry::store::{record_write, start_store_span};

pub struct LeaseReaper {
    store: Arc<dyn DocumentStore>,
    collection: CollectionDefinition,
    worker_id: String,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: CollectionDefinition,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection,
            worker_id: worker_id.into(),
        }
    }

    /// Sweep once against the current time. Returns how many claims were reclaimed.
    pub async fn reclaim_once(&self) -> Result<usize> {
        self.reclaim_expired(Utc::now()).await
    }

    /// Sweep once, treating claims that expired before `now` as abandoned.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.query_expired(&self.collection, now).await?;
        let mut reclaimed = 0;

        for Versioned { value: mut item, etag } in expired {
            if !item.is_lease_expired(now) {
                continue;
            }
            let previous_worker = item.current_worker.clone();
            if let Err(e) = item.mark_returned_to_pending() {
                error!(id = %item.id, "cannot reclaim item: {e}");
                continue;
            }

            let span = start_store_span("reclaim", &self.collection);
            match self
                .store
                .upsert_item(&self.collection, &item, Some(&etag))
                .instrument(span.clone())
                .await
            {
                Ok(response) => {
                    record_write(&span, "reclaim", &response);
                    info!(
                        id = %item.id,
                        previous_worker = previous_worker.as_deref().unwrap_or("-"),
                        errors = item.errors,
                        "reclaimed expired claim"
                    );
                    reclaimed += 1;
                }
                Err(e) if e.is_precondition_failed() => {
                    debug!(id = %item.id, "expired claim changed before reclaim, skipping");
                }
                Err(e) => {
                    error!(id = %item.id, "failed to reclaim expired claim: {e}");
                }
            }
        }

        if reclaimed > 0 {
            metrics::leases_reclaimed().add(
                reclaimed as u64,
                &[KeyValue::new("worker", self.worker_id.clone())],
            );
        }
        Ok(reclaimed)
    }

    /// Sweep every `interval` until cancelled. The first sweep runs one
    /// interval after start.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(worker = %self.worker_id, ?interval, "lease reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_once().await {
                        error!("lease sweep failed: {e}");
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "lease reaper stopped");
    }
}
