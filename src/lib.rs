//! # pubsub-relay
//!
//! `pubsub-relay` copies messages from a Cloud Pub/Sub subscription into a
//! BigQuery table. It long-polls the subscription, decodes each payload as a
//! JSON object, streams it as a row insert and acknowledges the batch.
//!
//! ## Core Modules
//!
//! - `client`: the `MessageQueue` and `RowSink` capabilities and their REST clients.
//! - `config`: loading and validating `setup.yaml`.
//! - `message`: pulled messages, wire shapes, and row decoding.
//! - `persistence`: the dead-letter store for messages the relay gave up on.
//! - `relay`: the pull → insert → acknowledge loop.
//! - `utils`: errors, backoff and logging.

pub mod client;
pub mod config;
pub mod message;
pub mod persistence;
pub mod relay;
pub mod utils;
