//! Postgres document store.
//!
//! Documents live as JSONB rows with a UUID etag and a feed position (`lsn`).
//! Writes to one collection are serialized by a transaction-scoped advisory
//! lock, so positions commit in order and the change feed can page with
//! `lsn > checkpoint`. Every write fires `pg_notify` to wake subscribers;
//! subscribers also poll as a fallback.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ChangeBatch, ChangeFeed, DocumentStore, StartFrom, SubscribeOptions, Subscription,
    WriteResponse,
};
use crate::config::CollectionDefinition;
use crate::error::{Error, Result};
use crate::model::{ETag, ItemId, QueueItem, Versioned};

/// NOTIFY channel carrying the name of the collection that changed.
const CHANGES_CHANNEL: &str = "docqueue_changes";

/// Postgres has no request units; every statement counts as one.
const REQUEST_CHARGE: f64 = 1.0;

/// Store handle. Owns the connection pool shared by all operations.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Fallback poll period for subscriptions when no NOTIFY arrives.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Migrate(e.to_string()))?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool. Outstanding connections are returned and dropped.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_write(&self, collection: &str) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn commit_write(mut tx: Transaction<'static, Postgres>, collection: &str) -> Result<()> {
        // NOTIFY only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGES_CHANNEL)
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn decode(body: serde_json::Value, etag: Uuid) -> Result<Versioned<QueueItem>> {
    let item: QueueItem = serde_json::from_value(body)?;
    Ok(Versioned::new(item, ETag(etag.to_string())))
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ensure_collection(&self, collection: &CollectionDefinition) -> Result<()> {
        let throughput = i32::try_from(collection.throughput).map_err(|_| {
            Error::Config(format!(
                "throughput {} for {} is out of range",
                collection.throughput,
                collection.qualified_name()
            ))
        })?;
        sqlx::query(
            "INSERT INTO queue_collections (name, throughput) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(collection.qualified_name())
        .bind(throughput)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_item(
        &self,
        collection: &CollectionDefinition,
        item: &QueueItem,
    ) -> Result<WriteResponse> {
        let start = Instant::now();
        let name = collection.qualified_name();
        let body = serde_json::to_value(item)?;
        let etag = Uuid::new_v4();

        let mut tx = self.begin_write(&name).await?;
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO queue_documents (collection, id, body, etag)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (collection, id) DO NOTHING
             RETURNING lsn",
        )
        .bind(&name)
        .bind(item.id.as_str())
        .bind(&body)
        .bind(etag)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            return Err(Error::AlreadyExists {
                id: item.id.to_string(),
            });
        }
        Self::commit_write(tx, &name).await?;

        Ok(WriteResponse {
            item: decode(body, etag)?,
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
        let name = collection.qualified_name();
        let body = serde_json::to_value(item)?;
        let etag = Uuid::new_v4();

        let mut tx = self.begin_write(&name).await?;
        let written: Option<(i64,)> = match expected {
            Some(expected) => {
                // A token we did not issue can never match.
                let Ok(expected) = Uuid::parse_str(expected.as_str()) else {
                    return Err(Error::PreconditionFailed {
                        id: item.id.to_string(),
                    });
                };
                sqlx::query_as(
                    "UPDATE queue_documents
                     SET body = $3, etag = $4, lsn = nextval('queue_documents_lsn')
                     WHERE collection = $1 AND id = $2 AND etag = $5
                     RETURNING lsn",
                )
                .bind(&name)
                .bind(item.id.as_str())
                .bind(&body)
                .bind(etag)
                .bind(expected)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(
                    "INSERT INTO queue_documents (collection, id, body, etag)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (collection, id) DO UPDATE
                     SET body = EXCLUDED.body, etag = EXCLUDED.etag,
                         lsn = nextval('queue_documents_lsn')
                     RETURNING lsn",
                )
                .bind(&name)
                .bind(item.id.as_str())
                .bind(&body)
                .bind(etag)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        if written.is_none() {
            return Err(Error::PreconditionFailed {
                id: item.id.to_string(),
            });
        }
        Self::commit_write(tx, &name).await?;

        Ok(WriteResponse {
            item: decode(body, etag)?,
            request_charge: REQUEST_CHARGE,
            latency: start.elapsed(),
        })
    }

    async fn read_item(
        &self,
        collection: &CollectionDefinition,
        id: &ItemId,
    ) -> Result<Option<Versioned<QueueItem>>> {
        let row: Option<(serde_json::Value, Uuid)> = sqlx::query_as(
            "SELECT body, etag FROM queue_documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection.qualified_name())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(body, etag)| decode(body, etag)).transpose()
    }

    async fn query_expired(
        &self,
        collection: &CollectionDefinition,
        now: DateTime<Utc>,
    ) -> Result<Vec<Versioned<QueueItem>>> {
        let rows: Vec<(serde_json::Value, Uuid)> = sqlx::query_as(
            "SELECT body, etag FROM queue_documents
             WHERE collection = $1
               AND body->>'status' = 'inprogress'
               AND (body->>'workerExpires')::bigint < $2
             ORDER BY id",
        )
        .bind(collection.qualified_name())
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body, etag)| decode(body, etag))
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for PgStore {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn Subscription>> {
        let collection = options.collection.qualified_name();
        let lease_collection = options.lease_collection.qualified_name();
        let lease_key = options.lease_key();

        let initial: i64 = match options.start {
            StartFrom::Beginning => 0,
            StartFrom::Now => {
                let (head,): (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(lsn), 0) FROM queue_documents WHERE collection = $1",
                )
                .bind(&collection)
                .fetch_one(&self.pool)
                .await?;
                head
            }
        };

        // An existing lease keeps its checkpoint; only ownership moves.
        let (checkpoint,): (i64,) = sqlx::query_as(
            "INSERT INTO feed_leases (lease_collection, lease_key, checkpoint, owner)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (lease_collection, lease_key) DO UPDATE
             SET owner = EXCLUDED.owner, renewed_at = now()
             RETURNING checkpoint",
        )
        .bind(&lease_collection)
        .bind(&lease_key)
        .bind(initial)
        .bind(&options.owner)
        .fetch_one(&self.pool)
        .await?;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGES_CHANNEL).await?;

        debug!(%collection, %lease_key, checkpoint, "change feed subscribed");

        Ok(Box::new(PgSubscription {
            pool: self.pool.clone(),
            listener,
            collection,
            lease_collection,
            lease_key,
            owner: options.owner,
            position: checkpoint,
            max_batch_size: options.max_batch_size.max(1) as i64,
            poll_interval: self.poll_interval,
            renew_interval: options.lease_renew_interval,
            last_renewed: Instant::now(),
        }))
    }
}

struct PgSubscription {
    pool: PgPool,
    listener: PgListener,
    collection: String,
    lease_collection: String,
    lease_key: String,
    owner: String,
    position: i64,
    max_batch_size: i64,
    poll_interval: Duration,
    renew_interval: Duration,
    last_renewed: Instant,
}

impl PgSubscription {
    async fn renew_if_due(&mut self) -> Result<()> {
        if self.last_renewed.elapsed() < self.renew_interval {
            return Ok(());
        }
        sqlx::query(
            "UPDATE feed_leases SET owner = $3, renewed_at = now()
             WHERE lease_collection = $1 AND lease_key = $2",
        )
        .bind(&self.lease_collection)
        .bind(&self.lease_key)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;
        self.last_renewed = Instant::now();
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<ChangeBatch>> {
        let rows: Vec<(serde_json::Value, Uuid, i64)> = sqlx::query_as(
            "SELECT body, etag, lsn FROM queue_documents
             WHERE collection = $1 AND lsn > $2
             ORDER BY lsn
             LIMIT $3",
        )
        .bind(&self.collection)
        .bind(self.position)
        .bind(self.max_batch_size)
        .fetch_all(&self.pool)
        .await?;

        let Some(&(_, _, last)) = rows.last() else {
            return Ok(None);
        };
        let items = rows
            .into_iter()
            .map(|(body, etag, _)| decode(body, etag))
            .collect::<Result<Vec<_>>>()?;
        self.position = last;

        Ok(Some(ChangeBatch {
            items,
            continuation: last as u64,
        }))
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        loop {
            self.renew_if_due().await?;
            if let Some(batch) = self.poll().await? {
                return Ok(Some(batch));
            }

            tokio::select! {
                notif = self.listener.recv() => {
                    if let Err(e) = notif {
                        warn!("change feed listener error: {e}, falling back to poll");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn checkpoint(&mut self, batch: &ChangeBatch) -> Result<()> {
        sqlx::query(
            "UPDATE feed_leases
             SET checkpoint = GREATEST(checkpoint, $3), renewed_at = now()
             WHERE lease_collection = $1 AND lease_key = $2",
        )
        .bind(&self.lease_collection)
        .bind(&self.lease_key)
        .bind(batch.continuation as i64)
        .execute(&self.pool)
        .await?;
        self.last_renewed = Instant::now();
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.listener.unlisten_all().await?;
        sqlx::query(
            "UPDATE feed_leases SET owner = NULL
             WHERE lease_collection = $1 AND lease_key = $2 AND owner = $3",
        )
        .bind(&self.lease_collection)
        .bind(&self.lease_key)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;
        debug!(collection = %self.collection, lease_key = %self.lease_key, "change feed released");
        Ok(())
    }
}
