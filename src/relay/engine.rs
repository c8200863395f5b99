//! Relay engine
//!
//! Drives pull → decode → insert → acknowledge for one subscription and one
//! table. Messages of a batch are handled strictly in delivery order, one at
//! a time; the batch is acknowledged with a single call at the end.
//!
//! Cancellation is observed at the start of each step, while waiting on a
//! pull, the empty-pull backoff or an insert, and between messages. An
//! interrupted insert is abandoned and its message left unacknowledged; an
//! acknowledge already in flight is allowed to finish. Once cancellation is
//! seen mid-batch nothing else is inserted or acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{MessageQueue, RowSink};
use crate::config::{AckPolicy, FailurePolicy, RelaySettings, TargetSettings};
use crate::message::{IdempotencyKey, ReceivedMessage, TableRef, decode_row};
use crate::persistence::{DeadLetter, DeadLetterStore};
use crate::utils::{Backoff, InsertError, RelayError, RetryPolicy};

/// What happened to one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Inserted,
    Failed(String),
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub inserted: usize,
    pub failed: usize,
    pub acknowledged: usize,
}

/// Result of a single `Relay::step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The pull returned nothing; the backoff has been waited out.
    Idle,
    Processed(BatchReport),
    /// The token was cancelled; the relay should stop.
    Cancelled,
}

/// Totals over the lifetime of a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub batches: u64,
    pub empty_pulls: u64,
    pub received: u64,
    pub inserted: u64,
    pub failed: u64,
    pub acknowledged: u64,
}

impl RelayStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.received += report.received as u64;
        self.inserted += report.inserted as u64;
        self.failed += report.failed as u64;
        self.acknowledged += report.acknowledged as u64;
    }
}

pub struct Relay {
    queue: Arc<dyn MessageQueue>,
    sink: Arc<dyn RowSink>,
    subscription: String,
    table: TableRef,
    settings: RelaySettings,
    dead_letters: Option<DeadLetterStore>,
    empty_backoff: Backoff,
    stats: RelayStats,
}

impl Relay {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        sink: Arc<dyn RowSink>,
        target: &TargetSettings,
        settings: RelaySettings,
    ) -> Self {
        let empty_backoff = Backoff::new(RetryPolicy::new(
            Duration::from_millis(settings.empty_backoff_initial_ms),
            Duration::from_millis(settings.empty_backoff_max_ms),
        ));

        Self {
            queue,
            sink,
            subscription: target.subscription_path(),
            table: TableRef {
                project_id: target.project_id.clone(),
                dataset_id: target.dataset_id.clone(),
                table_id: target.table_id.clone(),
            },
            settings,
            dead_letters: None,
            empty_backoff,
            stats: RelayStats::default(),
        }
    }

    /// Store used when the failure policy is `dead_letter`.
    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Steps until cancelled or until a fatal error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RelayStats, RelayError> {
        info!(
            "relaying {} -> {} (batch size {})",
            self.subscription, self.table, self.settings.batch_size
        );
        loop {
            if self.step(&cancel).await? == StepOutcome::Cancelled {
                info!("relay stopped: {:?}", self.stats);
                return Ok(self.stats);
            }
        }
    }

    /// One pull/insert/acknowledge cycle.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<StepOutcome, RelayError> {
        if cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }

        let messages = tokio::select! {
            _ = cancel.cancelled() => return Ok(StepOutcome::Cancelled),
            pulled = self.queue.pull(
                &self.subscription,
                self.settings.batch_size,
                self.settings.return_immediately,
            ) => pulled?,
        };

        if messages.is_empty() {
            self.stats.empty_pulls += 1;
            let delay = self.empty_backoff.next_delay();
            debug!(
                "empty pull #{}, waiting {:?}",
                self.empty_backoff.consecutive(),
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            return Ok(StepOutcome::Idle);
        }
        self.empty_backoff.reset();

        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };
        let mut ack_ids = Vec::with_capacity(messages.len());

        for (index, message) in messages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    "cancelled mid-batch after {} of {} messages; none acknowledged",
                    index,
                    messages.len()
                );
                return Ok(StepOutcome::Cancelled);
            }

            let delivered = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "cancelled while delivering message {} of {}; none acknowledged",
                        index + 1,
                        messages.len()
                    );
                    return Ok(StepOutcome::Cancelled);
                }
                delivered = self.deliver(message) => delivered,
            };
            let delivery = match delivered {
                Ok(delivery) => delivery,
                Err(err) => {
                    self.flush_partial(&ack_ids).await;
                    return Err(err);
                }
            };

            let acknowledge = match &delivery {
                Delivery::Inserted => {
                    report.inserted += 1;
                    true
                }
                Delivery::Failed(_) => {
                    report.failed += 1;
                    self.settings.ack_policy == AckPolicy::AfterAttempt
                }
            };
            if acknowledge {
                ack_ids.push(message.ack_id.clone());
            }
        }

        if !ack_ids.is_empty() {
            self.queue.acknowledge(&self.subscription, &ack_ids).await?;
        }
        report.acknowledged = ack_ids.len();

        self.stats.absorb(&report);
        info!(
            "batch done: received={} inserted={} failed={} acknowledged={}",
            report.received, report.inserted, report.failed, report.acknowledged
        );
        Ok(StepOutcome::Processed(report))
    }

    /// Decode and insert one message. `Err` only for failures that must stop
    /// the relay under the configured failure policy.
    async fn deliver(&self, message: &ReceivedMessage) -> Result<Delivery, RelayError> {
        let row = match decode_row(message) {
            Ok(row) => {
                debug!(
                    "pulled message {}: {}",
                    message.message_id,
                    serde_json::Value::Object(row.clone())
                );
                row
            }
            Err(source) => {
                let reason = source.to_string();
                if self.settings.failure_policy == FailurePolicy::Abort {
                    return Err(RelayError::Decode {
                        message_id: message.message_id.clone(),
                        source,
                    });
                }
                return self.dead_letter(message, reason);
            }
        };

        let key = IdempotencyKey::generate();
        match self
            .sink
            .insert_row(&self.table, &row, &key, self.settings.insert_retries)
            .await
        {
            Ok(()) => Ok(Delivery::Inserted),
            Err(source) => self.insert_failed(message, source),
        }
    }

    fn insert_failed(
        &self,
        message: &ReceivedMessage,
        source: InsertError,
    ) -> Result<Delivery, RelayError> {
        let reason = source.to_string();
        match self.settings.failure_policy {
            FailurePolicy::DeadLetter => self.dead_letter(message, reason),
            FailurePolicy::Abort if source.is_row_level() => {
                warn!("message {} not inserted: {}", message.message_id, reason);
                Ok(Delivery::Failed(reason))
            }
            FailurePolicy::Abort => Err(RelayError::Insert {
                message_id: message.message_id.clone(),
                source,
            }),
        }
    }

    fn dead_letter(&self, message: &ReceivedMessage, reason: String) -> Result<Delivery, RelayError> {
        warn!("dead-lettering message {}: {}", message.message_id, reason);
        if let Some(store) = &self.dead_letters {
            store.record(&DeadLetter::from_message(message, reason.clone()))?;
        }
        Ok(Delivery::Failed(reason))
    }

    /// Best-effort acknowledge of the messages handled before a fatal error.
    async fn flush_partial(&self, ack_ids: &[String]) {
        if ack_ids.is_empty() {
            return;
        }
        match self.queue.acknowledge(&self.subscription, ack_ids).await {
            Ok(()) => info!("acknowledged {} messages before stopping", ack_ids.len()),
            Err(e) => warn!("could not acknowledge {} messages before stopping: {e}", ack_ids.len()),
        }
    }
}
