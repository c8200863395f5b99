//! The `utils` module holds the pieces shared by every other module:
//! the error types, the backoff schedule and the logging bootstrap.

pub mod backoff;
pub mod error;
pub mod logging;

pub use backoff::{Backoff, RetryPolicy};
pub use error::{DecodeError, InsertError, QueueError, RelayError, StoreError};
