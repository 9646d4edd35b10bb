//! Error types for docqueue.

use thiserror::Error;

use crate::model::ItemStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// The store rejected a conditional write because the presented token is stale.
    #[error("precondition failed for queue item {id}")]
    PreconditionFailed { id: String },

    #[error("queue item already exists: {id}")]
    AlreadyExists { id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ItemStatus, to: ItemStatus },

    /// Caller misuse: starting twice, producing before initialize, missing handler.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when a conditional write lost against a concurrent writer.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Error::PreconditionFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
