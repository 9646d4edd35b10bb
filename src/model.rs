//! Core data model.
//!
//! A queue item is one unit of work persisted as a document. Its status moves
//! Pending -> InProgress -> {Completed | Pending}; every move is a pure
//! in-memory mutation that the caller persists with a conditional write.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers and tokens
// ---------------------------------------------------------------------------

/// Opaque queue item identifier. Supplied by the producer or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Concurrency token issued by the store on every write.
///
/// Never part of the document body; it travels next to it in [`Versioned`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(pub String);

impl ETag {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document together with the token it was read or written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: ETag,
}

impl<T> Versioned<T> {
    pub fn new(value: T, etag: ETag) -> Self {
        Self { value, etag }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting for a worker to claim it.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Done. Terminal.
    Completed,
}

impl ItemStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Pending) // failed attempt or expired lease
                | (Pending, Pending) // idempotent return
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "inprogress",
            ItemStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "inprogress" => Ok(ItemStatus::InProgress),
            "completed" => Ok(ItemStatus::Completed),
            _ => Err(Error::Other(format!("unknown item status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue item
// ---------------------------------------------------------------------------

/// The persisted queue item document.
///
/// Field names are the wire contract with the store. Timestamps are Unix
/// seconds; cleared fields serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: ItemId,

    pub status: ItemStatus,

    /// Producer payload. Never interpreted by the queue.
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub queued_time: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub process_start_time: Option<DateTime<Utc>>,

    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub completed_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub current_worker: Option<String>,

    /// Lease horizon of the current claim.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub worker_expires: Option<DateTime<Utc>>,

    /// Failed processing attempts. Never decreases.
    #[serde(default)]
    pub errors: u32,
}

impl QueueItem {
    /// A fresh Pending item queued at `now`.
    pub fn new(id: ItemId, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: ItemStatus::Pending,
            data,
            queued_time: now,
            process_start_time: None,
            completed_time: None,
            current_worker: None,
            worker_expires: None,
            errors: 0,
        }
    }

    fn check_transition(&self, to: ItemStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    /// Pending -> InProgress, owned by `worker_id` until `now + lease`.
    pub fn mark_claimed(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != ItemStatus::Pending {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: ItemStatus::InProgress,
            });
        }
        let expires = lease_horizon(now, lease)?;

        self.status = ItemStatus::InProgress;
        self.current_worker = Some(worker_id.to_string());
        self.process_start_time = Some(now);
        self.worker_expires = Some(expires);
        Ok(())
    }

    /// InProgress -> Completed. Terminal.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(ItemStatus::Completed)?;

        self.status = ItemStatus::Completed;
        self.completed_time = Some(now);
        self.current_worker = None;
        self.worker_expires = None;
        Ok(())
    }

    /// InProgress -> Pending (counts a failed attempt), or a no-op from Pending.
    pub fn mark_returned_to_pending(&mut self) -> Result<()> {
        self.check_transition(ItemStatus::Pending)?;

        if self.status == ItemStatus::InProgress {
            self.errors += 1;
        }
        self.status = ItemStatus::Pending;
        self.current_worker = None;
        self.process_start_time = None;
        self.worker_expires = None;
        Ok(())
    }

    /// Is this an InProgress claim whose lease horizon has passed?
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::InProgress
            && self.worker_expires.is_some_and(|expires| expires < now)
    }
}

/// The instant a lease taken at `now` runs out.
///
/// Fails with `Config` when the lease does not fit the timestamp range.
pub fn lease_horizon(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| Error::Config(format!("lease of {lease:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pending() -> QueueItem {
        QueueItem::new(ItemId::from("item-1"), json!({"n": 1}), at(1_000))
    }

    #[test]
    fn claim_sets_worker_and_lease() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();

        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.current_worker.as_deref(), Some("w1"));
        assert_eq!(item.process_start_time, Some(at(2_000)));
        assert_eq!(item.worker_expires, Some(at(2_060)));
        assert_eq!(item.queued_time, at(1_000));
    }

    #[test]
    fn claim_requires_pending() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();

        let err = item
            .mark_claimed("w2", Duration::from_secs(60), at(2_001))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(item.current_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn complete_clears_claim() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();
        item.mark_completed(at(2_010)).unwrap();

        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.completed_time, Some(at(2_010)));
        assert!(item.current_worker.is_none());
        assert!(item.worker_expires.is_none());
        assert_eq!(item.errors, 0);
    }

    #[test]
    fn completed_is_terminal() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();
        item.mark_completed(at(2_010)).unwrap();

        assert!(item.mark_returned_to_pending().is_err());
        assert!(item.mark_completed(at(2_020)).is_err());
        assert!(
            item.mark_claimed("w2", Duration::from_secs(1), at(2_030))
                .is_err()
        );
        assert_eq!(item.completed_time, Some(at(2_010)));
    }

    #[test]
    fn oversized_lease_is_rejected_without_claiming() {
        let mut item = pending();
        let err = item
            .mark_claimed("w1", Duration::from_secs(10_000_000_000_000), at(2_000))
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.current_worker.is_none());
        assert!(item.worker_expires.is_none());
    }

    #[test]
    fn complete_requires_in_progress() {
        let mut item = pending();
        assert!(item.mark_completed(at(2_000)).is_err());
        assert!(item.completed_time.is_none());
    }

    #[test]
    fn return_to_pending_counts_one_error() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();
        item.mark_returned_to_pending().unwrap();

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.errors, 1);
        assert!(item.current_worker.is_none());
        assert!(item.process_start_time.is_none());
        assert!(item.worker_expires.is_none());
    }

    #[test]
    fn return_to_pending_twice_is_idempotent() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();
        item.mark_returned_to_pending().unwrap();
        item.mark_returned_to_pending().unwrap();

        assert_eq!(item.errors, 1);
        assert_eq!(item.status, ItemStatus::Pending);
    }

    #[test]
    fn lease_expiry_only_applies_to_in_progress() {
        let mut item = pending();
        assert!(!item.is_lease_expired(at(10_000)));

        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();
        assert!(!item.is_lease_expired(at(2_059)));
        assert!(item.is_lease_expired(at(2_061)));
    }

    #[test]
    fn wire_shape_uses_contract_field_names() {
        let mut item = pending();
        item.mark_claimed("w1", Duration::from_secs(60), at(2_000))
            .unwrap();

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["id"], "item-1");
        assert_eq!(value["status"], "inprogress");
        assert_eq!(value["queuedTime"], 1_000);
        assert_eq!(value["processStartTime"], 2_000);
        assert_eq!(value["workerExpires"], 2_060);
        assert_eq!(value["currentWorker"], "w1");
        assert!(value["completedTime"].is_null());
        assert_eq!(value["errors"], 0);
        assert!(value.get("etag").is_none());
    }

    #[test]
    fn status_parses_wire_names() {
        assert_eq!("pending".parse::<ItemStatus>().unwrap(), ItemStatus::Pending);
        assert_eq!(
            "inprogress".parse::<ItemStatus>().unwrap(),
            ItemStatus::InProgress
        );
        assert!("running".parse::<ItemStatus>().is_err());
    }
}
