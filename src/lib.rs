//! # docqueue
//!
//! A work queue on top of a document store with conditional writes and an
//! ordered change feed.
//!
//! Producers insert Pending items. Consumers watch the change feed, claim
//! Pending items with compare-and-swap writes, run a user handler, and move
//! each item to Completed or back to Pending with its error count bumped.
//! The conditional write is the only coordination between workers.
//!
//! Stores: an in-process [`store::MemoryStore`] and a Postgres-backed
//! [`store::PgStore`] (sqlx, LISTEN/NOTIFY). Observability via tracing and
//! OpenTelemetry.

pub mod config;
pub mod consumer;
pub mod error;
pub mod model;
pub mod producer;
pub mod store;
pub mod telemetry;

pub use consumer::{
    ConsumerHandle, HandlerOutcome, MessageHandler, QueueConsumer, ReceivedItem, handler_fn,
};
pub use error::{Error, Result};
pub use producer::QueueProducer;
