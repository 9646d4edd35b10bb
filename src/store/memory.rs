//! In-process document store with an ordered change feed.
//!
//! Documents are kept as JSON values so every read and write goes through the
//! same wire shape a remote store would see. Each write assigns a new token and
//! a new log sequence number; the change feed replays the latest version of
//! every document whose sequence number is past the subscriber's position.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};

use super::{
    ChangeBatch, ChangeFeed, DocumentStore, StartFrom, SubscribeOptions, Subscription,
    WriteResponse,
};
use crate::config::CollectionDefinition;
use crate::error::{Error, Result};
use crate::model::{ETag, ItemId, QueueItem, Versioned};

const REQUEST_CHARGE: f64 = 1.0;

struct Document {
    body: serde_json::Value,
    etag: ETag,
    lsn: u64,
}

impl Document {
    fn to_versioned(&self) -> Result<Versioned<QueueItem>> {
        let item: QueueItem = serde_json::from_value(self.body.clone())?;
        Ok(Versioned::new(item, self.etag.clone()))
    }
}

#[derive(Default)]
struct CollectionState {
    docs: HashMap<ItemId, Document>,
    next_lsn: u64,
    throughput: u32,
}

impl CollectionState {
    fn write(&mut self, item: &QueueItem) -> Result<Versioned<QueueItem>> {
        self.next_lsn += 1;
        let doc = Document {
            body: serde_json::to_value(item)?,
            etag: ETag::generate(),
            lsn: self.next_lsn,
        };
        let stored = doc.to_versioned()?;
        self.docs.insert(item.id.clone(), doc);
        Ok(stored)
    }
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, CollectionState>,
    /// (lease collection, lease key) -> checkpointed position.
    checkpoints: HashMap<(String, String), u64>,
    /// Lease owners, released on close.
    owners: HashMap<(String, String), String>,
    writes: u64,
    failures_to_inject: u32,
}

impl MemoryState {
    fn collection_mut(&mut self, def: &CollectionDefinition) -> Result<&mut CollectionState> {
        let name = def.qualified_name();
        self.collections
            .get_mut(&name)
            .ok_or_else(|| Error::NotFound(format!("collection {name}")))
    }

    fn take_injected_failure(&mut self) -> Result<()> {
        if self.failures_to_inject > 0 {
            self.failures_to_inject -= 1;
            return Err(Error::Other("injected store failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory `DocumentStore` + `ChangeFeed`. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            changes,
        }
    }

    /// Make the next `n` writes fail with a non-precondition error.
    pub async fn fail_next_writes(&self, n: u32) {
        self.state.lock().await.failures_to_inject = n;
    }

    /// Number of successful writes so far.
    pub async fn write_count(&self) -> u64 {
        self.state.lock().await.writes
    }

    /// Throughput hint a collection was provisioned with, if it exists.
    pub async fn collection_throughput(&self, collection: &CollectionDefinition) -> Option<u32> {
        let state = self.state.lock().await;
        state
            .collections
            .get(&collection.qualified_name())
            .map(|c| c.throughput)
    }

    /// Current checkpoint for a lease key, if one was persisted.
    pub async fn checkpoint_of(
        &self,
        lease_collection: &CollectionDefinition,
        lease_key: &str,
    ) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .checkpoints
            .get(&(lease_collection.qualified_name(), lease_key.to_string()))
            .copied()
    }

    /// Current owner of a lease key, if any.
    pub async fn lease_owner(
        &self,
        lease_collection: &CollectionDefinition,
        lease_key: &str,
    ) -> Option<String> {
        let state = self.state.lock().await;
        state
            .owners
            .get(&(lease_collection.qualified_name(), lease_key.to_string()))
            .cloned()
    }

    fn publish(&self) {
        self.changes.send_modify(|seq| *seq += 1);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_collection(&self, collection: &CollectionDefinition) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .collections
            .entry(collection.qualified_name())
            .or_insert_with(|| CollectionState {
                throughput: collection.throughput,
                ..Default::default()
            });
        Ok(())
    }

    async fn create_item(
        &self,
        collection: &CollectionDefinition,
        item: &QueueItem,
    ) -> Result<WriteResponse> {
        let start = Instant::now();
        let stored = {
            let mut state = self.state.lock().await;
            state.take_injected_failure()?;
            let coll = state.collection_mut(collection)?;
            if coll.docs.contains_key(&item.id) {
                return Err(Error::AlreadyExists {
                    id: item.id.to_string(),
                });
            }
            let stored = coll.write(item)?;
            state.writes += 1;
            stored
        };
        self.publish();

        Ok(WriteResponse {
            item: stored,
            request_charge: REQUEST_CHARGE,
            latency: start.elapsed(),
        })
    }

    async fn upsert_item(
        &self,
        collection: &CollectionDefinition,
        item: &QueueItem,
        expected: Option<&ETag>,
    ) -> Result<WriteResponse> {
        let start = Instant::now();
        let stored = {
            let mut state = self.state.lock().await;
            state.take_injected_failure()?;
            let coll = state.collection_mut(collection)?;
            if let Some(expected) = expected {
                let current = coll.docs.get(&item.id).map(|d| &d.etag);
                if current != Some(expected) {
                    return Err(Error::PreconditionFailed {
                        id: item.id.to_string(),
                    });
                }
            }
            let stored = coll.write(item)?;
            state.writes += 1;
            stored
        };
        self.publish();

        Ok(WriteResponse {
            item: stored,
            request_charge: REQUEST_CHARGE,
            latency: start.elapsed(),
        })
    }

    async fn read_item(
        &self,
        collection: &CollectionDefinition,
        id: &ItemId,
    ) -> Result<Option<Versioned<QueueItem>>> {
        let mut state = self.state.lock().await;
        let coll = state.collection_mut(collection)?;
        coll.docs.get(id).map(Document::to_versioned).transpose()
    }

    async fn query_expired(
        &self,
        collection: &CollectionDefinition,
        now: DateTime<Utc>,
    ) -> Result<Vec<Versioned<QueueItem>>> {
        let mut state = self.state.lock().await;
        let coll = state.collection_mut(collection)?;

        let mut expired = Vec::new();
        for doc in coll.docs.values() {
            let versioned = doc.to_versioned()?;
            if versioned.value.is_lease_expired(now) {
                expired.push(versioned);
            }
        }
        expired.sort_by(|a, b| a.value.id.cmp(&b.value.id));
        Ok(expired)
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn Subscription>> {
        let lease = (
            options.lease_collection.qualified_name(),
            options.lease_key(),
        );
        let position = {
            let mut state = self.state.lock().await;
            if !state
                .collections
                .contains_key(&options.lease_collection.qualified_name())
            {
                return Err(Error::NotFound(format!(
                    "lease collection {}",
                    options.lease_collection.qualified_name()
                )));
            }
            let head = state.collection_mut(&options.collection)?.next_lsn;
            state.owners.insert(lease.clone(), options.owner.clone());
            match state.checkpoints.get(&lease) {
                Some(checkpoint) => *checkpoint,
                None => match options.start {
                    StartFrom::Beginning => 0,
                    StartFrom::Now => head,
                },
            }
        };

        Ok(Box::new(MemorySubscription {
            state: Arc::clone(&self.state),
            changes: self.changes.subscribe(),
            collection: options.collection,
            lease,
            position,
            max_batch_size: options.max_batch_size.max(1),
        }))
    }
}

struct MemorySubscription {
    state: Arc<Mutex<MemoryState>>,
    changes: watch::Receiver<u64>,
    collection: CollectionDefinition,
    lease: (String, String),
    position: u64,
    max_batch_size: usize,
}

impl MemorySubscription {
    async fn poll(&mut self) -> Result<Option<ChangeBatch>> {
        let mut state = self.state.lock().await;
        let coll = state.collection_mut(&self.collection)?;

        let mut changed: Vec<&Document> = coll
            .docs
            .values()
            .filter(|d| d.lsn > self.position)
            .collect();
        if changed.is_empty() {
            return Ok(None);
        }
        changed.sort_by_key(|d| d.lsn);
        changed.truncate(self.max_batch_size);

        let continuation = changed.last().map(|d| d.lsn).unwrap_or(self.position);
        let items = changed
            .into_iter()
            .map(Document::to_versioned)
            .collect::<Result<Vec<_>>>()?;
        self.position = continuation;
        Ok(Some(ChangeBatch {
            items,
            continuation,
        }))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        loop {
            // Mark the current version seen before polling so a write that
            // lands between the poll and the wait still wakes us.
            self.changes.borrow_and_update();
            if let Some(batch) = self.poll().await? {
                return Ok(Some(batch));
            }
            if self.changes.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn checkpoint(&mut self, batch: &ChangeBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.checkpoints.entry(self.lease.clone()).or_insert(0);
        *entry = (*entry).max(batch.continuation);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.owners.remove(&self.lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// How long to wait on a feed that should stay quiet.
    const QUIET: Duration = Duration::from_millis(50);

    fn queue() -> CollectionDefinition {
        CollectionDefinition::new("db", "queue")
    }

    fn leases() -> CollectionDefinition {
        CollectionDefinition::new("db", "leases")
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.ensure_collection(&queue()).await.unwrap();
        store.ensure_collection(&leases()).await.unwrap();
        store
    }

    fn options(prefix: &str, start: StartFrom) -> SubscribeOptions {
        SubscribeOptions {
            collection: queue(),
            lease_collection: leases(),
            lease_prefix: format!("{prefix}_"),
            owner: prefix.to_string(),
            start,
            max_batch_size: 10,
            lease_renew_interval: Duration::from_secs(15),
        }
    }

    fn item(id: &str) -> QueueItem {
        QueueItem::new(ItemId::from(id), json!({"id": id}), Utc::now())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = store().await;
        store.create_item(&queue(), &item("a")).await.unwrap();

        let err = store.create_item(&queue(), &item("a")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_token() {
        let store = store().await;
        let created = store.create_item(&queue(), &item("a")).await.unwrap();
        let stale = created.item.etag.clone();

        let updated = store
            .upsert_item(&queue(), &created.item.value, Some(&stale))
            .await
            .unwrap();
        assert_ne!(updated.item.etag, stale);

        let err = store
            .upsert_item(&queue(), &created.item.value, Some(&stale))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn conditional_write_on_missing_document_fails() {
        let store = store().await;
        let err = store
            .upsert_item(&queue(), &item("ghost"), Some(&ETag::generate()))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn unknown_collection_is_not_found() {
        let store = MemoryStore::new();
        let err = store.create_item(&queue(), &item("a")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_not_preconditions() {
        let store = store().await;
        store.fail_next_writes(1).await;

        let err = store.create_item(&queue(), &item("a")).await.unwrap_err();
        assert!(!err.is_precondition_failed());
        store.create_item(&queue(), &item("a")).await.unwrap();
    }

    #[tokio::test]
    async fn feed_from_beginning_replays_latest_versions() {
        let store = store().await;
        let created = store.create_item(&queue(), &item("a")).await.unwrap();
        store.create_item(&queue(), &item("b")).await.unwrap();
        let mut a = created.item.value.clone();
        a.errors = 3;
        store
            .upsert_item(&queue(), &a, Some(&created.item.etag))
            .await
            .unwrap();

        let mut sub = store
            .subscribe(options("w1", StartFrom::Beginning))
            .await
            .unwrap();
        let batch = sub.next_batch().await.unwrap().unwrap();

        let ids: Vec<_> = batch.items.iter().map(|v| v.value.id.0.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(batch.items[1].value.errors, 3);
    }

    #[tokio::test]
    async fn feed_from_now_skips_history() {
        let store = store().await;
        store.create_item(&queue(), &item("old")).await.unwrap();

        let mut sub = store.subscribe(options("w1", StartFrom::Now)).await.unwrap();
        let quiet = tokio::time::timeout(QUIET, sub.next_batch()).await;
        assert!(quiet.is_err());

        store.create_item(&queue(), &item("new")).await.unwrap();
        let batch = sub.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].value.id.as_str(), "new");
    }

    #[tokio::test]
    async fn checkpoint_resumes_per_lease_prefix() {
        let store = store().await;
        store.create_item(&queue(), &item("a")).await.unwrap();

        let mut sub = store
            .subscribe(options("w1", StartFrom::Beginning))
            .await
            .unwrap();
        let batch = sub.next_batch().await.unwrap().unwrap();
        sub.checkpoint(&batch).await.unwrap();
        sub.close().await.unwrap();

        store.create_item(&queue(), &item("b")).await.unwrap();

        // Same prefix resumes after the checkpoint.
        let mut resumed = store
            .subscribe(options("w1", StartFrom::Beginning))
            .await
            .unwrap();
        let batch = resumed.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].value.id.as_str(), "b");

        // Another prefix sees everything.
        let mut other = store
            .subscribe(options("w2", StartFrom::Beginning))
            .await
            .unwrap();
        let batch = other.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 2);
    }

    #[tokio::test]
    async fn close_releases_lease_owner() {
        let store = store().await;
        let opts = options("w1", StartFrom::Beginning);
        let key = opts.lease_key();

        let sub = store.subscribe(opts).await.unwrap();
        assert_eq!(store.lease_owner(&leases(), &key).await.as_deref(), Some("w1"));

        sub.close().await.unwrap();
        assert!(store.lease_owner(&leases(), &key).await.is_none());
    }

    #[tokio::test]
    async fn query_expired_returns_only_stale_claims() {
        let store = store().await;
        let now = Utc::now();

        let mut stale = item("stale");
        stale
            .mark_claimed("w1", Duration::from_secs(1), now - chrono::TimeDelta::seconds(10))
            .unwrap();
        let mut fresh = item("fresh");
        fresh.mark_claimed("w1", Duration::from_secs(600), now).unwrap();

        store.upsert_item(&queue(), &stale, None).await.unwrap();
        store.upsert_item(&queue(), &fresh, None).await.unwrap();
        store.upsert_item(&queue(), &item("pending"), None).await.unwrap();

        let expired = store.query_expired(&queue(), now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].value.id.as_str(), "stale");
    }
}
