use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration for the relay.
///
/// `env` names the source subscription and the destination table; the
/// remaining sections tune the loop and its clients.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub env: TargetSettings,
    pub relay: RelaySettings,
    pub endpoints: EndpointSettings,
    pub auth: AuthSettings,
    pub dead_letter: DeadLetterSettings,
    pub logging: LoggingSettings,
}

/// Where messages come from and where rows go. All four keys are required.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TargetSettings {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub subscription: String,
}

impl TargetSettings {
    /// The subscription as a full resource name.
    ///
    /// A bare name is placed under the configured project; anything already
    /// containing `/subscriptions/` is used as given.
    pub fn subscription_path(&self) -> String {
        if self.subscription.contains("/subscriptions/") {
            self.subscription.clone()
        } else {
            format!(
                "projects/{}/subscriptions/{}",
                self.project_id, self.subscription
            )
        }
    }
}

/// What to do when a message cannot be decoded or inserted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the relay with the error.
    #[default]
    Abort,
    /// Record the message in the dead-letter store and keep going.
    DeadLetter,
}

/// Which messages of a batch get acknowledged.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every message an insert was attempted for, whatever the outcome.
    #[default]
    AfterAttempt,
    /// Only messages whose row was inserted; failures are redelivered.
    AfterInsert,
}

/// Tuning for the relay loop.
#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    pub batch_size: u32,
    pub return_immediately: bool,
    pub insert_retries: u32,
    pub insert_retry_base_ms: u64,
    pub empty_backoff_initial_ms: u64,
    pub empty_backoff_max_ms: u64,
    pub failure_policy: FailurePolicy,
    pub ack_policy: AckPolicy,
}

/// Base URLs of the two REST services.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointSettings {
    pub pubsub_url: String,
    pub bigquery_url: String,
    pub request_timeout_secs: u64,
}

/// Bearer token attached to every request, if any.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSettings {
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeadLetterSettings {
    pub path: String,
    pub max_entries: Option<usize>,
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Everything is optional here; `load_config` fills the gaps from
/// `Settings::default()` and rejects a missing `env` key.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub env: Option<PartialTargetSettings>,
    pub relay: Option<PartialRelaySettings>,
    pub endpoints: Option<PartialEndpointSettings>,
    pub auth: Option<AuthSettings>,
    pub dead_letter: Option<PartialDeadLetterSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

/// The `env` section, read case-insensitively.
///
/// `setup.yaml` spells the keys in upper case while `RELAY_ENV__*` variables
/// arrive lower-cased, so both spellings can be present at once. The
/// lower-case one is the environment override and wins.
#[derive(Debug, Deserialize, Default)]
#[serde(from = "HashMap<String, String>")]
pub struct PartialTargetSettings {
    pub project_id: Option<String>,
    pub dataset_id: Option<String>,
    pub table_id: Option<String>,
    pub subscription: Option<String>,
}

impl From<HashMap<String, String>> for PartialTargetSettings {
    fn from(keys: HashMap<String, String>) -> Self {
        let mut entries: Vec<(String, String)> = keys.into_iter().collect();
        entries.sort_by_key(|(key, _)| !key.chars().any(char::is_uppercase));

        let mut target = Self::default();
        for (key, value) in entries {
            let slot = match key.to_lowercase().as_str() {
                "project_id" => &mut target.project_id,
                "dataset_id" => &mut target.dataset_id,
                "table_id" => &mut target.table_id,
                "subscription" => &mut target.subscription,
                _ => continue,
            };
            *slot = Some(value);
        }
        target
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRelaySettings {
    pub batch_size: Option<u32>,
    pub return_immediately: Option<bool>,
    pub insert_retries: Option<u32>,
    pub insert_retry_base_ms: Option<u64>,
    pub empty_backoff_initial_ms: Option<u64>,
    pub empty_backoff_max_ms: Option<u64>,
    pub failure_policy: Option<FailurePolicy>,
    pub ack_policy: Option<AckPolicy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialEndpointSettings {
    pub pubsub_url: Option<String>,
    pub bigquery_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeadLetterSettings {
    pub path: Option<String>,
    pub max_entries: Option<usize>,
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            return_immediately: false,
            insert_retries: 5,
            insert_retry_base_ms: 1000,
            empty_backoff_initial_ms: 250,
            empty_backoff_max_ms: 30_000,
            failure_policy: FailurePolicy::Abort,
            ack_policy: AckPolicy::AfterAttempt,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            pubsub_url: "https://pubsub.googleapis.com".to_string(),
            bigquery_url: "https://bigquery.googleapis.com".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            path: "relay_dead_letters".to_string(),
            max_entries: Some(10_000),
            ttl_secs: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
