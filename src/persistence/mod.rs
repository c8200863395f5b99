//! The `persistence` module keeps messages the relay could not deliver.
//!
//! It is only used when the failure policy is `dead_letter`: instead of
//! stopping, the relay writes the failed message here and moves on. The
//! store is an embedded `sled` database.

pub mod sled_store;

pub use sled_store::{DeadLetter, DeadLetterStore};
