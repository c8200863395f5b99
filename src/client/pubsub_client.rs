//! Cloud Pub/Sub v1 REST client.
//!
//! Only the two calls the relay needs: `subscriptions.pull` and
//! `subscriptions.acknowledge`. Pointing `base_url` at the emulator works
//! without a token.

use async_trait::async_trait;
use tracing::debug;

use super::{MessageQueue, with_auth};
use crate::message::{AcknowledgeRequest, PullRequest, PullResponse, ReceivedMessage};
use crate::utils::QueueError;

#[derive(Debug, Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl PubSubClient {
    pub fn new(http: reqwest::Client, base_url: &str, access_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn url(&self, subscription: &str, method: &str) -> String {
        format!("{}/v1/{}:{}", self.base_url, subscription, method)
    }
}

#[async_trait]
impl MessageQueue for PubSubClient {
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
        return_immediately: bool,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let body = PullRequest {
            return_immediately,
            max_messages,
        };
        let request = self.http.post(self.url(subscription, "pull")).json(&body);

        let response = with_auth(request, self.access_token.as_deref())
            .send()
            .await
            .map_err(|source| QueueError::Pull {
                subscription: subscription.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                operation: "pull",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PullResponse = response.json().await.map_err(|source| QueueError::Pull {
            subscription: subscription.to_string(),
            source,
        })?;
        let messages = parsed.into_messages();
        debug!("pulled {} messages from {}", messages.len(), subscription);
        Ok(messages)
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: &[String],
    ) -> Result<(), QueueError> {
        let body = AcknowledgeRequest {
            ack_ids: ack_ids.to_vec(),
        };
        let request = self
            .http
            .post(self.url(subscription, "acknowledge"))
            .json(&body);

        let response = with_auth(request, self.access_token.as_deref())
            .send()
            .await
            .map_err(|source| QueueError::Acknowledge {
                subscription: subscription.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                operation: "acknowledge",
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
