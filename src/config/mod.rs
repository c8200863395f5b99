mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::{PartialSettings, PartialTargetSettings};

pub use settings::{
    AckPolicy, AuthSettings, DeadLetterSettings, EndpointSettings, FailurePolicy,
    LoggingSettings, RelaySettings, Settings, TargetSettings,
};

/// Base name of the setup file looked up in the working directory.
pub const SETUP_FILE: &str = "setup";

/// Loads the configuration from `setup.*` in the working directory and
/// `RELAY_*` environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(Path::new(SETUP_FILE))
}

/// Loads the configuration from the given file (extension optional) and the
/// environment, then merges it with default values.
///
/// Environment variables use `RELAY_` as prefix and `__` between sections,
/// e.g. `RELAY_AUTH__ACCESS_TOKEN`.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let env = required_target(partial.env.unwrap_or_default())?;

    let relay_default = RelaySettings::default();
    let relay = partial.relay.unwrap_or_default();
    let relay = RelaySettings {
        batch_size: relay.batch_size.unwrap_or(relay_default.batch_size),
        return_immediately: relay
            .return_immediately
            .unwrap_or(relay_default.return_immediately),
        insert_retries: relay
            .insert_retries
            .unwrap_or(relay_default.insert_retries),
        insert_retry_base_ms: relay
            .insert_retry_base_ms
            .unwrap_or(relay_default.insert_retry_base_ms),
        empty_backoff_initial_ms: relay
            .empty_backoff_initial_ms
            .unwrap_or(relay_default.empty_backoff_initial_ms),
        empty_backoff_max_ms: relay
            .empty_backoff_max_ms
            .unwrap_or(relay_default.empty_backoff_max_ms),
        failure_policy: relay
            .failure_policy
            .unwrap_or(relay_default.failure_policy),
        ack_policy: relay.ack_policy.unwrap_or(relay_default.ack_policy),
    };

    if relay.batch_size == 0 {
        return Err(ConfigError::Message(
            "relay.batch_size must be at least 1".to_string(),
        ));
    }
    if relay.empty_backoff_initial_ms > relay.empty_backoff_max_ms {
        return Err(ConfigError::Message(
            "relay.empty_backoff_initial_ms must not exceed relay.empty_backoff_max_ms"
                .to_string(),
        ));
    }

    let endpoints_default = EndpointSettings::default();
    let endpoints = partial.endpoints.unwrap_or_default();
    let endpoints = EndpointSettings {
        pubsub_url: endpoints
            .pubsub_url
            .unwrap_or(endpoints_default.pubsub_url),
        bigquery_url: endpoints
            .bigquery_url
            .unwrap_or(endpoints_default.bigquery_url),
        request_timeout_secs: endpoints
            .request_timeout_secs
            .unwrap_or(endpoints_default.request_timeout_secs),
    };

    let dead_letter_default = DeadLetterSettings::default();
    let dead_letter = partial.dead_letter.unwrap_or_default();
    let dead_letter = DeadLetterSettings {
        path: dead_letter.path.unwrap_or(dead_letter_default.path),
        max_entries: dead_letter.max_entries.or(dead_letter_default.max_entries),
        ttl_secs: dead_letter.ttl_secs.or(dead_letter_default.ttl_secs),
    };
    if matches!(dead_letter.ttl_secs, Some(ttl) if ttl <= 0) {
        return Err(ConfigError::Message(
            "dead_letter.ttl_secs must be positive".to_string(),
        ));
    }

    let logging = LoggingSettings {
        level: partial
            .logging
            .and_then(|l| l.level)
            .unwrap_or(LoggingSettings::default().level),
    };

    Ok(Settings {
        env,
        relay,
        endpoints,
        auth: partial.auth.unwrap_or_default(),
        dead_letter,
        logging,
    })
}

fn required_target(partial: PartialTargetSettings) -> Result<TargetSettings, ConfigError> {
    fn require(value: Option<String>, key: &str) -> Result<String, ConfigError> {
        match value {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(ConfigError::NotFound(format!("env.{key}"))),
        }
    }

    Ok(TargetSettings {
        project_id: require(partial.project_id, "PROJECT_ID")?,
        dataset_id: require(partial.dataset_id, "DATASET_ID")?,
        table_id: require(partial.table_id, "TABLE_ID")?,
        subscription: require(partial.subscription, "SUBSCRIPTION")?,
    })
}
