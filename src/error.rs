//! Error types of the cache layer and of the backing store seam.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a backing store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A connection slot could not be opened or did not pass its readiness check.
    #[error("connection slot {slot} is not ready: {reason}")]
    NotReady { slot: usize, reason: String },

    /// A query against the store failed.
    #[error("query failed: {0}")]
    Query(String),

    /// A row lacks a field the record mapping requires.
    #[error("row has no field '{0}'")]
    MissingField(String),

    /// A row field holds a value of an unexpected shape.
    #[error("field '{field}' is malformed: {reason}")]
    Malformed { field: String, reason: String },
}

/// Errors surfaced by the cache, the batching queue, the scheduler, the pool and the feed service.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The fetch function of a read-through call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The fetch function did not complete within the caller-supplied timeout.
    #[error("fetch for '{segment}/{key}' timed out after {timeout:?}")]
    FetchTimeout {
        segment: String,
        key:     String,
        timeout: Duration,
    },

    /// The queue went away before the key left its pending batch.
    #[error("pending '{kind}' write for '{key}' was dropped before flush")]
    BatchDropped { kind: String, key: String },

    /// None of the pool's connections initialized.
    #[error("connection pool is exhausted: 0 of {attempted} connections became ready")]
    PoolExhausted { attempted: usize },

    #[error("connection pool is not initialized; call init() first")]
    PoolNotInitialized,

    /// A cached value does not have the shape the reader expects.
    #[error("unexpected value cached under '{segment}/{key}'")]
    UnexpectedValue { segment: String, key: String },

    /// A feed request was rejected before reaching the store.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("news '{0}' not found")]
    NewsNotFound(String),

    /// Only the author may edit or delete a news item.
    #[error("user '{user_id}' is not the author of news '{news_id}'")]
    NotAuthor { news_id: String, user_id: String },

    /// A precomputation job failed.
    #[error("precompute job '{job}' failed: {reason}")]
    Job { job: String, reason: String },

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),
}

impl CacheError {
    /// `true` for errors that originate in the backing store or in waiting for it.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::FetchTimeout { .. })
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
