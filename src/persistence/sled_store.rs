use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::warn;

use crate::message::ReceivedMessage;
use crate::utils::StoreError;

/// A message the relay gave up on, kept for inspection and replay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub ack_id: String,
    /// Payload exactly as pulled (still base64).
    pub data: String,
    pub reason: String,
    pub failed_at: i64,
}

impl DeadLetter {
    pub fn from_message(message: &ReceivedMessage, reason: impl Into<String>) -> Self {
        Self {
            message_id: message.message_id.clone(),
            ack_id: message.ack_id.clone(),
            data: message.data.clone(),
            reason: reason.into(),
            failed_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Dead-letter store backed by `sled`.
///
/// Keys are the big-endian failure time in milliseconds followed by a
/// per-store sequence number, so iteration is oldest first.
#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_entries: Option<usize>,
}

impl DeadLetterStore {
    pub fn open(
        path: &str,
        ttl_seconds: Option<i64>,
        max_entries: Option<usize>,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_entries,
        })
    }

    pub fn record(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(letter)?;
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&letter.failed_at.to_be_bytes());
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());

        self.db.insert(key, serialized)?;
        self.trim_to_max()?;
        self.db.flush()?;
        Ok(())
    }

    /// All stored letters, oldest first. Expired entries are purged first.
    pub fn load(&self) -> Result<Vec<DeadLetter>, StoreError> {
        self.cleanup_expired()?;
        let letters = self
            .db
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| match serde_json::from_slice(&val) {
                Ok(letter) => Some(letter),
                Err(e) => {
                    warn!("skipping unreadable dead letter: {e}");
                    None
                }
            })
            .collect();
        Ok(letters)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    fn trim_to_max(&self) -> Result<(), StoreError> {
        if let Some(max) = self.max_entries {
            while self.db.len() > max {
                match self.db.pop_min()? {
                    Some(_) => {}
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<(), StoreError> {
        if let Some(ttl) = self.ttl_seconds {
            let expiry_ms = Utc::now()
                .timestamp_millis()
                .saturating_sub(ttl.saturating_mul(1000));

            let old_keys: Vec<_> = self
                .db
                .iter()
                .filter_map(|res| res.ok())
                .filter_map(|(key, _)| {
                    let ts = i64::from_be_bytes(key.get(..8)?.try_into().ok()?);
                    if ts < expiry_ms { Some(key) } else { None }
                })
                .collect();

            for key in old_keys {
                self.db.remove(key)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
