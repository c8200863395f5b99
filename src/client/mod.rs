//! The `client` module defines the two capabilities the relay consumes and
//! their REST implementations.
//!
//! - `MessageQueue`: pull a batch from a subscription and acknowledge it.
//! - `RowSink`: stream one row into a table.
//!
//! The relay only sees the traits, so tests drive it with in-memory fakes.

pub mod bigquery_client;
pub mod pubsub_client;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EndpointSettings;
use crate::message::{IdempotencyKey, ReceivedMessage, Row, TableRef};
use crate::utils::{InsertError, QueueError};

pub use bigquery_client::BigQueryClient;
pub use pubsub_client::PubSubClient;

/// Pull/acknowledge side of a subscription.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Pull up to `max_messages`. With `return_immediately` false the call
    /// waits server-side until messages arrive or the server times out.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
        return_immediately: bool,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String])
    -> Result<(), QueueError>;
}

/// Row insert side of the destination table.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Insert one row. Transient failures are retried internally up to
    /// `num_retries` more times, all with the same `insert_id`.
    async fn insert_row(
        &self,
        table: &TableRef,
        row: &Row,
        insert_id: &IdempotencyKey,
        num_retries: u32,
    ) -> Result<(), InsertError>;
}

/// Shared HTTP client for both services.
pub fn build_http_client(endpoints: &EndpointSettings) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(endpoints.request_timeout_secs))
        .user_agent(concat!("pubsub-relay/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn with_auth(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}
