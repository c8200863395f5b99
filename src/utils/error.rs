//! The `error` module defines the error types used across the relay.
//!
//! Each external boundary has its own enum so callers can tell a queue
//! outage from a rejected row. `RelayError` aggregates them for the loop.

use thiserror::Error;

/// Failures talking to the message queue. Always fatal to the relay.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("pull from {subscription} failed: {source}")]
    Pull {
        subscription: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("acknowledge on {subscription} failed: {source}")]
    Acknowledge {
        subscription: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("queue returned HTTP {status} for {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
}

/// Failures turning a pulled message into a row.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is JSON but not an object (found {0})")]
    NotAnObject(&'static str),
}

/// Failures inserting a row into the destination table.
#[derive(Debug, Error)]
pub enum InsertError {
    /// Transient failures kept happening until the retry budget ran out.
    #[error("insert gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The table rejected the request outright.
    #[error("insert returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request was accepted but the row itself was refused.
    #[error("row rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl InsertError {
    /// Whether the relay may treat this as an ordinary failed delivery
    /// rather than a reason to stop.
    pub fn is_row_level(&self) -> bool {
        matches!(self, InsertError::Rejected(_))
    }
}

/// Failures from the dead-letter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dead-letter store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("dead-letter record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level error returned by the relay loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("message {message_id}: {source}")]
    Decode {
        message_id: String,
        #[source]
        source: DecodeError,
    },

    #[error("message {message_id}: {source}")]
    Insert {
        message_id: String,
        #[source]
        source: InsertError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
