//! Optimistic claim of observed Pending items.
//!
//! A claim is one conditional write presenting the token the item was observed
//! with. Losing the race is expected under contention and is never retried
//! inside the same batch; the item comes back through the feed if it returns
//! to Pending.

use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error};

use crate::config::CollectionDefinition;
use crate::error::Error;
use crate::model::{QueueItem, Versioned};
use crate::store::DocumentStore;
use crate::telemetry::metrics;
use crate::telemetry::store::{record_write, start_store_span};

/// Result of one claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// This worker owns the item; carries the token issued by the claim write.
    Acquired(Versioned<QueueItem>),
    /// Someone else changed the item since it was observed.
    Conflict,
    /// Any other failure. The durable item is unchanged.
    Failed(Error),
}

impl Claim {
    fn result_label(&self) -> &'static str {
        match self {
            Claim::Acquired(_) => "acquired",
            Claim::Conflict => "conflict",
            Claim::Failed(_) => "error",
        }
    }
}

/// Try to move one observed item to InProgress for `worker_id`.
pub async fn try_claim(
    store: &dyn DocumentStore,
    collection: &CollectionDefinition,
    worker_id: &str,
    lease: Duration,
    observed: Versioned<QueueItem>,
) -> Claim {
    let Versioned { value: mut item, etag } = observed;

    let claim = match item.mark_claimed(worker_id, lease, Utc::now()) {
        Err(e) => Claim::Failed(e),
        Ok(()) => {
            let span = start_store_span("claim", collection);
            match store
                .upsert_item(collection, &item, Some(&etag))
                .instrument(span.clone())
                .await
            {
                Ok(response) => {
                    record_write(&span, "claim", &response);
                    Claim::Acquired(response.item)
                }
                Err(e) if e.is_precondition_failed() => Claim::Conflict,
                Err(e) => Claim::Failed(e),
            }
        }
    };

    match &claim {
        Claim::Acquired(_) => debug!(id = %item.id, worker = worker_id, "claimed"),
        Claim::Conflict => debug!(id = %item.id, worker = worker_id, "claim conflict, skipping"),
        Claim::Failed(e) => error!(id = %item.id, worker = worker_id, "claim failed: {e}"),
    }
    metrics::claim_attempts().add(
        1,
        &[
            KeyValue::new("worker", worker_id.to_string()),
            KeyValue::new("result", claim.result_label()),
        ],
    );
    claim
}

/// Claim every observed item.
///
/// Sequential mode claims one at a time in input order. Otherwise all claims
/// run concurrently. Results line up with the input in both modes.
pub async fn try_acquire_locks(
    store: &dyn DocumentStore,
    collection: &CollectionDefinition,
    worker_id: &str,
    lease: Duration,
    observed: Vec<Versioned<QueueItem>>,
    sequential: bool,
) -> Vec<Claim> {
    if sequential {
        let mut claims = Vec::with_capacity(observed.len());
        for item in observed {
            claims.push(try_claim(store, collection, worker_id, lease, item).await);
        }
        claims
    } else {
        futures::future::join_all(
            observed
                .into_iter()
                .map(|item| try_claim(store, collection, worker_id, lease, item)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemId, ItemStatus};
    use crate::store::MemoryStore;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn queue() -> CollectionDefinition {
        CollectionDefinition::new("db", "queue")
    }

    async fn seeded(ids: &[&str]) -> (MemoryStore, Vec<Versioned<QueueItem>>) {
        let store = MemoryStore::new();
        store.ensure_collection(&queue()).await.unwrap();
        let mut observed = Vec::new();
        for id in ids {
            let item = QueueItem::new(ItemId::from(*id), json!({}), Utc::now());
            observed.push(store.create_item(&queue(), &item).await.unwrap().item);
        }
        (store, observed)
    }

    #[tokio::test]
    async fn claim_marks_item_in_progress() {
        let (store, observed) = seeded(&["a"]).await;
        let original = observed[0].etag.clone();

        let Claim::Acquired(claimed) =
            try_claim(&store, &queue(), "w1", LEASE, observed[0].clone()).await
        else {
            panic!("expected claim to succeed");
        };

        assert_eq!(claimed.value.status, ItemStatus::InProgress);
        assert_eq!(claimed.value.current_worker.as_deref(), Some("w1"));
        assert_ne!(claimed.etag, original);

        let stored = store
            .read_item(&queue(), &ItemId::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, claimed);
    }

    #[tokio::test]
    async fn same_token_claims_have_one_winner() {
        let (store, observed) = seeded(&["a"]).await;

        let (queue_a, queue_b) = (queue(), queue());
        let (first, second) = tokio::join!(
            try_claim(&store, &queue_a, "w1", LEASE, observed[0].clone()),
            try_claim(&store, &queue_b, "w2", LEASE, observed[0].clone()),
        );

        let winners = [&first, &second]
            .iter()
            .filter(|c| matches!(c, Claim::Acquired(_)))
            .count();
        let conflicts = [&first, &second]
            .iter()
            .filter(|c| matches!(c, Claim::Conflict))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict_not_an_overwrite() {
        let (store, observed) = seeded(&["a"]).await;
        let stale = observed[0].clone();

        assert!(matches!(
            try_claim(&store, &queue(), "w1", LEASE, stale.clone()).await,
            Claim::Acquired(_)
        ));
        assert!(matches!(
            try_claim(&store, &queue(), "w2", LEASE, stale).await,
            Claim::Conflict
        ));

        let stored = store
            .read_item(&queue(), &ItemId::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value.current_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn write_fault_is_reported_as_failure() {
        let (store, observed) = seeded(&["a"]).await;
        store.fail_next_writes(1).await;

        let claim = try_claim(&store, &queue(), "w1", LEASE, observed[0].clone()).await;
        assert!(matches!(claim, Claim::Failed(_)));

        let stored = store
            .read_item(&queue(), &ItemId::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value.status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn batch_claims_keep_input_order() {
        for sequential in [true, false] {
            let (store, observed) = seeded(&["a", "b", "c"]).await;
            let claims =
                try_acquire_locks(&store, &queue(), "w1", LEASE, observed, sequential).await;

            let ids: Vec<_> = claims
                .iter()
                .map(|c| match c {
                    Claim::Acquired(v) => v.value.id.to_string(),
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(ids, ["a", "b", "c"]);
        }
    }
}
