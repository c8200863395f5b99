use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::message::ReceivedMessage;
use crate::utils::DecodeError;

/// A row as handed to the insert client: column name to value.
pub type Row = Map<String, Value>;

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Per-attempt insert id. The warehouse drops a second insert carrying the
/// same id, so a retried request cannot double a row; a redelivered message
/// gets a new key and is not deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decodes the base64 payload of `message` and parses it as a JSON object.
pub fn decode_row(message: &ReceivedMessage) -> Result<Row, DecodeError> {
    let bytes = decode_payload(&message.data)?;
    parse_row(&bytes)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(data.trim())?)
}

/// Parses raw bytes into a row. Only JSON objects are rows.
pub fn parse_row(bytes: &[u8]) -> Result<Row, DecodeError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(DecodeError::NotAnObject("null")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("boolean")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
    }
}
