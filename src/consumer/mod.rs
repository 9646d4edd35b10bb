//! Consumer session: change feed -> claim -> dispatch.
//!
//! A session binds one worker identity to a change-feed subscription. Every
//! delivered batch is filtered to Pending items, claimed with conditional
//! writes, and the winners are dispatched to the handler. The batch is
//! checkpointed only after every item in it has been resolved or abandoned.
//! Items whose claim write failed are re-read and retried first; the
//! checkpoint never moves past an item that is still Pending for that reason.

pub mod dispatch;
pub mod handler;
pub mod lock;
pub mod reaper;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::{CollectionDefinition, ConsumerSettings};
use crate::error::{Error, Result};
use crate::model::{ItemId, ItemStatus, QueueItem, Versioned, lease_horizon};
use crate::store::{ChangeFeed, DocumentStore, StartFrom, SubscribeOptions, Subscription};

pub use dispatch::{ReceivedItem, Resolution};
pub use handler::{FnHandler, HandlerOutcome, MessageHandler, handler_fn};
pub use lock::Claim;
pub use reaper::LeaseReaper;

use dispatch::Dispatcher;
use lock::try_acquire_locks;

/// Back-off after the feed or a claim write reports an error.
const FEED_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Batch processing
// ---------------------------------------------------------------------------

/// What happened to one delivered batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items in the batch that were Pending when observed.
    pub pending: usize,
    /// Claims this worker won.
    pub claimed: usize,
    /// Claims lost to a concurrent writer.
    pub conflicts: usize,
    /// Items whose claim write failed for another reason. They are still
    /// Pending in the store.
    pub failed: Vec<ItemId>,
    /// Resolutions of the claimed items, in dispatch completion order.
    pub resolutions: Vec<Resolution>,
}

/// Claims and dispatches the items of one batch for one worker.
#[derive(Clone)]
pub struct BatchProcessor {
    store: Arc<dyn DocumentStore>,
    dispatcher: Dispatcher,
    collection: CollectionDefinition,
    worker_id: String,
    lease: Duration,
    sequential: bool,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        handler: Arc<dyn MessageHandler>,
        settings: &ConsumerSettings,
        worker_id: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            dispatcher: Dispatcher {
                store: Arc::clone(&store),
                handler,
                collection: settings.queue_collection.clone(),
                worker_id: worker_id.clone(),
                auto_complete: settings.auto_complete,
            },
            store,
            collection: settings.queue_collection.clone(),
            worker_id,
            lease: settings.processing_item_timeout,
            sequential: settings.single_threaded_processing,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one batch to completion.
    ///
    /// Returns once every Pending item in the batch has been claimed and
    /// resolved, or abandoned. Sequential mode dispatches winners one at a
    /// time in batch order; otherwise each winner gets its own task.
    pub async fn process_batch(&self, batch: &[Versioned<QueueItem>]) -> BatchReport {
        let pending: Vec<_> = batch
            .iter()
            .filter(|v| v.value.status == ItemStatus::Pending)
            .cloned()
            .collect();

        let mut report = BatchReport {
            pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return report;
        }

        let ids: Vec<ItemId> = pending.iter().map(|v| v.value.id.clone()).collect();
        let claims = try_acquire_locks(
            self.store.as_ref(),
            &self.collection,
            &self.worker_id,
            self.lease,
            pending,
            self.sequential,
        )
        .await;

        let mut won = Vec::new();
        for (id, claim) in ids.into_iter().zip(claims) {
            match claim {
                Claim::Acquired(item) => won.push(item),
                Claim::Conflict => report.conflicts += 1,
                Claim::Failed(_) => report.failed.push(id),
            }
        }
        report.claimed = won.len();

        if self.sequential {
            for item in won {
                report.resolutions.push(self.dispatcher.dispatch(item).await);
            }
        } else {
            let mut tasks = JoinSet::new();
            for item in won {
                let dispatcher = self.dispatcher.clone();
                tasks.spawn(
                    async move { dispatcher.dispatch(item).await }.in_current_span(),
                );
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(resolution) => report.resolutions.push(resolution),
                    Err(e) => error!(worker = %self.worker_id, "dispatch task failed: {e}"),
                }
            }
        }

        report
    }

    /// Re-read items whose claim failed and run the ones still Pending.
    ///
    /// Items that can't be read stay in `failed`; items that moved on or
    /// disappeared are dropped.
    pub async fn retry_failed(&self, failed: &[ItemId]) -> BatchReport {
        let mut current = Vec::with_capacity(failed.len());
        let mut unreadable = Vec::new();
        for id in failed {
            match self.store.read_item(&self.collection, id).await {
                Ok(Some(item)) => current.push(item),
                Ok(None) => warn!(id = %id, "item disappeared before claim retry"),
                Err(e) => {
                    error!(id = %id, "failed to re-read item: {e}");
                    unreadable.push(id.clone());
                }
            }
        }

        let mut report = self.process_batch(&current).await;
        report.failed.extend(unreadable);
        report
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Queue consumer. Started at most once.
pub struct QueueConsumer {
    store: Arc<dyn DocumentStore>,
    feed: Arc<dyn ChangeFeed>,
    handler: Option<Arc<dyn MessageHandler>>,
    started: AtomicBool,
}

impl QueueConsumer {
    pub fn new(store: Arc<dyn DocumentStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            handler: None,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Ensure the collections exist, subscribe, and spawn the session.
    ///
    /// Fails with `Usage` before any I/O when no handler is set or the
    /// consumer was already started, and with `Config` when the processing
    /// timeout can't be represented as a lease. Cancelling `cancel` (or calling
    /// [`ConsumerHandle::shutdown`]) stops batch intake; a batch already being
    /// processed runs to completion.
    pub async fn start(
        &self,
        settings: ConsumerSettings,
        cancel: CancellationToken,
    ) -> Result<ConsumerHandle> {
        let Some(handler) = self.handler.clone() else {
            return Err(Error::Usage(
                "a message handler must be set before starting the consumer".to_string(),
            ));
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Usage("consumer already started".to_string()));
        }

        match self.launch(settings, handler, cancel.child_token()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        settings: ConsumerSettings,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<ConsumerHandle> {
        lease_horizon(Utc::now(), settings.processing_item_timeout)?;

        let worker_id = if settings.worker_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            settings.worker_id.clone()
        };

        self.store
            .ensure_collection(&settings.queue_collection)
            .await?;
        self.store
            .ensure_collection(&settings.lease_collection)
            .await?;

        let subscription = self
            .feed
            .subscribe(SubscribeOptions {
                collection: settings.queue_collection.clone(),
                lease_collection: settings.lease_collection.clone(),
                lease_prefix: format!("{worker_id}_"),
                owner: worker_id.clone(),
                start: if settings.start_from_beginning {
                    StartFrom::Beginning
                } else {
                    StartFrom::Now
                },
                max_batch_size: settings.max_batch_size,
                lease_renew_interval: settings.lease_renew_interval,
            })
            .await?;

        info!(
            worker = %worker_id,
            collection = %settings.queue_collection.qualified_name(),
            parallel = !settings.single_threaded_processing,
            auto_complete = settings.auto_complete,
            "consumer session started"
        );

        let processor = BatchProcessor::new(Arc::clone(&self.store), handler, &settings, &worker_id);
        let span = tracing::info_span!("docqueue.consumer", worker = %worker_id);
        let session = tokio::spawn(run_session(subscription, processor, cancel.clone()).instrument(span));

        let reaper = settings.reclaim_interval.map(|interval| {
            let reaper = LeaseReaper::new(
                Arc::clone(&self.store),
                settings.queue_collection.clone(),
                &worker_id,
            );
            tokio::spawn(reaper.run(interval, cancel.clone()))
        });

        Ok(ConsumerHandle {
            worker_id,
            cancel,
            session,
            reaper,
        })
    }
}

async fn run_session(
    mut subscription: Box<dyn Subscription>,
    processor: BatchProcessor,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next_batch() => next,
        };

        match next {
            Ok(Some(batch)) => {
                let report = processor.process_batch(&batch.items).await;
                if report.pending > 0 {
                    info!(
                        changed = batch.items.len(),
                        pending = report.pending,
                        claimed = report.claimed,
                        conflicts = report.conflicts,
                        failed = report.failed.len(),
                        "batch processed"
                    );
                }
                if !settle_failed_claims(&processor, report, &cancel).await {
                    // not checkpointed; the batch is delivered again on resume
                    break;
                }
                if let Err(e) = subscription.checkpoint(&batch).await {
                    error!("failed to checkpoint change feed: {e}");
                }
            }
            Ok(None) => {
                warn!("change feed closed");
                break;
            }
            Err(e) => {
                error!("change feed error: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FEED_RETRY_DELAY) => {}
                }
            }
        }
    }

    subscription.close().await?;
    info!(worker = %processor.worker_id(), "consumer session stopped");
    Ok(())
}

/// Retry failed claims until none are left. False if cancelled first.
async fn settle_failed_claims(
    processor: &BatchProcessor,
    mut report: BatchReport,
    cancel: &CancellationToken,
) -> bool {
    while !report.failed.is_empty() {
        warn!(
            failed = report.failed.len(),
            "claim writes failed, retrying before checkpoint"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(FEED_RETRY_DELAY) => {}
        }
        report = processor.retry_failed(&report.failed).await;
    }
    true
}

/// Handle on a running session.
#[derive(Debug)]
pub struct ConsumerHandle {
    worker_id: String,
    cancel: CancellationToken,
    session: JoinHandle<Result<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// The worker identity the session runs under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop batch intake. In-flight dispatches finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session (and the sweep) to exit.
    pub async fn join(self) -> Result<()> {
        let session = self
            .session
            .await
            .map_err(|e| Error::Other(format!("consumer session task failed: {e}")));
        if let Some(reaper) = self.reaper {
            // the sweep exits on the same token
            self.cancel.cancel();
            if let Err(e) = reaper.await {
                error!("lease reaper task failed: {e}");
            }
        }
        session?
    }

    pub async fn shutdown_and_join(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
