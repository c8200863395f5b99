use std::sync::Arc;
use std::time::Duration;

use pubsub_relay::client::{BigQueryClient, PubSubClient, build_http_client};
use pubsub_relay::config::{FailurePolicy, Settings, load_config};
use pubsub_relay::persistence::DeadLetterStore;
use pubsub_relay::relay::Relay;
use pubsub_relay::utils::logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    logging::init(&config.logging.level);

    if let Err(e) = run_relay(config).await {
        error!("Relay failed: {}", e);
        return Err(e);
    }

    println!("Exiting application");
    Ok(())
}

async fn run_relay(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let http = build_http_client(&config.endpoints)?;
    let token = config.auth.access_token.clone();

    let queue = PubSubClient::new(http.clone(), &config.endpoints.pubsub_url, token.clone());
    let sink = BigQueryClient::new(
        http,
        &config.endpoints.bigquery_url,
        token,
        BigQueryClient::default_retry(Duration::from_millis(config.relay.insert_retry_base_ms)),
    );

    let mut relay = Relay::new(
        Arc::new(queue),
        Arc::new(sink),
        &config.env,
        config.relay.clone(),
    );
    if config.relay.failure_policy == FailurePolicy::DeadLetter {
        let store = DeadLetterStore::open(
            &config.dead_letter.path,
            config.dead_letter.ttl_secs,
            config.dead_letter.max_entries,
        )?;
        info!(
            "dead letters go to {} ({} stored)",
            config.dead_letter.path,
            store.len()
        );
        relay = relay.with_dead_letters(store);
    }

    let cancel = CancellationToken::new();
    let listener = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received.");
        listener.cancel();

        shutdown_signal().await;
        warn!("Second shutdown signal received, exiting without waiting.");
        println!("Exiting application");
        std::process::exit(0);
    });

    let stats = relay.run(cancel).await?;
    info!(
        "relayed {} messages in {} batches ({} failed, {} acknowledged)",
        stats.received, stats.batches, stats.failed, stats.acknowledged
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
