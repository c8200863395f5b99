//! The `message` module holds the data that flows through the relay: pulled
//! messages and their wire shapes, and the rows decoded from them.

pub mod envelope;
pub mod row;

pub use envelope::{AcknowledgeRequest, PullRequest, PullResponse, ReceivedMessage};
pub use row::{IdempotencyKey, Row, TableRef, decode_row};
