use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message delivered by a pull, as the relay sees it.
///
/// `data` is still in its transport encoding (base64); `decode_row` turns it
/// into a row. `ack_id` is only valid on the subscription that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: String,
    pub publish_time: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// Body of `projects.subscriptions.pull`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub return_immediately: bool,
    pub max_messages: u32,
}

/// Response of `projects.subscriptions.pull`. The service omits
/// `receivedMessages` entirely when nothing was available.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub received_messages: Vec<WireReceivedMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReceivedMessage {
    pub ack_id: String,
    pub message: Option<WireMessage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub message_id: String,
    pub publish_time: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Body of `projects.subscriptions.acknowledge`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    pub ack_ids: Vec<String>,
}

impl PullResponse {
    /// Flattens the wire shape. Entries without a `message` body are
    /// skipped, as are their ack ids.
    pub fn into_messages(self) -> Vec<ReceivedMessage> {
        self.received_messages
            .into_iter()
            .filter_map(|received| {
                let message = received.message?;
                Some(ReceivedMessage {
                    ack_id: received.ack_id,
                    message_id: message.message_id,
                    data: message.data,
                    publish_time: message.publish_time,
                    attributes: message.attributes,
                })
            })
            .collect()
    }
}
