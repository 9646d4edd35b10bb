//! Persistence adapter boundary.
//!
//! The queue coordinates only through two store capabilities: conditional
//! single-document writes (`DocumentStore`) and an ordered change stream
//! (`ChangeFeed`). Partition ownership, checkpoint persistence and
//! re-delivery belong to the feed implementation, not to the queue core.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::CollectionDefinition;
use crate::error::Result;
use crate::model::{ETag, ItemId, QueueItem, Versioned};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of a successful write.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    /// The document as stored, with the freshly issued token.
    pub item: Versioned<QueueItem>,
    /// Store-reported cost of the request.
    pub request_charge: f64,
    pub latency: Duration,
}

/// Document operations against one store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Provision the collection if it does not exist yet.
    async fn ensure_collection(&self, collection: &CollectionDefinition) -> Result<()>;

    /// Insert a new document. Fails with `AlreadyExists` if the id is taken.
    async fn create_item(
        &self,
        collection: &CollectionDefinition,
        item: &QueueItem,
    ) -> Result<WriteResponse>;

    /// Write a document. With `expected`, the write only succeeds if the
    /// stored token still matches; otherwise `PreconditionFailed`.
    async fn upsert_item(
        &self,
        collection: &CollectionDefinition,
        item: &QueueItem,
        expected: Option<&ETag>,
    ) -> Result<WriteResponse>;

    async fn read_item(
        &self,
        collection: &CollectionDefinition,
        id: &ItemId,
    ) -> Result<Option<Versioned<QueueItem>>>;

    /// InProgress items whose lease horizon is before `now`.
    async fn query_expired(
        &self,
        collection: &CollectionDefinition,
        now: DateTime<Utc>,
    ) -> Result<Vec<Versioned<QueueItem>>>;
}

/// Where a new subscription starts when no checkpoint exists for its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Beginning,
    Now,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub collection: CollectionDefinition,
    pub lease_collection: CollectionDefinition,
    /// Lease namespace. Each prefix keeps its own checkpoint.
    pub lease_prefix: String,
    pub owner: String,
    pub start: StartFrom,
    pub max_batch_size: usize,
    pub lease_renew_interval: Duration,
}

impl SubscribeOptions {
    /// Key under which the checkpoint is stored in the lease collection.
    pub fn lease_key(&self) -> String {
        format!("{}{}", self.lease_prefix, self.collection.qualified_name())
    }
}

/// A batch of changed documents, latest version of each.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub items: Vec<Versioned<QueueItem>>,
    /// Feed position of the last change in the batch.
    pub continuation: u64,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next batch. `None` once the feed is gone.
    async fn next_batch(&mut self) -> Result<Option<ChangeBatch>>;

    /// Persist that everything up to `batch.continuation` was handled.
    async fn checkpoint(&mut self, batch: &ChangeBatch) -> Result<()>;

    /// Release the lease.
    async fn close(self: Box<Self>) -> Result<()>;
}
