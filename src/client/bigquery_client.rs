//! BigQuery v2 streaming insert client (`tabledata.insertAll`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{RowSink, with_auth};
use crate::message::{IdempotencyKey, Row, TableRef};
use crate::utils::{InsertError, RetryPolicy};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InsertAllRequest<'a> {
    pub rows: Vec<InsertAllRow<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InsertAllRow<'a> {
    pub insert_id: &'a str,
    pub json: &'a Row,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InsertAllResponse {
    #[serde(default)]
    pub insert_errors: Vec<RowInsertErrors>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RowInsertErrors {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorProto {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub message: String,
}

impl InsertAllResponse {
    fn rejection(&self) -> Option<String> {
        if self.insert_errors.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .insert_errors
            .iter()
            .flat_map(|row| {
                row.errors.iter().map(move |e| {
                    if e.location.is_empty() {
                        format!("row {}: {} ({})", row.index, e.message, e.reason)
                    } else {
                        format!(
                            "row {}: {}: {} ({})",
                            row.index, e.location, e.message, e.reason
                        )
                    }
                })
            })
            .collect();
        Some(parts.join("; "))
    }
}

/// Status codes worth another attempt.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[derive(Debug, Clone)]
pub struct BigQueryClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    retry: RetryPolicy,
}

impl BigQueryClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        access_token: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            retry,
        }
    }

    /// Retry schedule matching the client libraries: one second doubling per
    /// attempt, with jitter.
    pub fn default_retry(base: Duration) -> RetryPolicy {
        RetryPolicy::new(base, Duration::from_secs(32))
    }

    fn url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base_url, table.project_id, table.dataset_id, table.table_id
        )
    }

    /// One HTTP round trip.
    async fn attempt(
        &self,
        url: &str,
        body: &InsertAllRequest<'_>,
    ) -> Result<(), Attempt> {
        let request = self.http.post(url).json(body);
        let response = match with_auth(request, self.access_token.as_deref()).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Err(Attempt::Retry(e.to_string()));
            }
            Err(e) => return Err(Attempt::Fatal(InsertError::Other(e.to_string()))),
        };

        let status = response.status();
        if is_retryable(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Retry(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(InsertError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        let parsed: InsertAllResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(InsertError::Other(e.to_string())))?;
        match parsed.rejection() {
            Some(reason) => Err(Attempt::Fatal(InsertError::Rejected(reason))),
            None => Ok(()),
        }
    }
}

enum Attempt {
    Retry(String),
    Fatal(InsertError),
}

#[async_trait]
impl RowSink for BigQueryClient {
    async fn insert_row(
        &self,
        table: &TableRef,
        row: &Row,
        insert_id: &IdempotencyKey,
        num_retries: u32,
    ) -> Result<(), InsertError> {
        let url = self.url(table);
        let body = InsertAllRequest {
            rows: vec![InsertAllRow {
                insert_id: insert_id.as_str(),
                json: row,
            }],
        };

        let mut retries = 0;
        loop {
            match self.attempt(&url, &body).await {
                Ok(()) => return Ok(()),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(reason)) => {
                    if retries >= num_retries {
                        return Err(InsertError::Exhausted {
                            attempts: retries + 1,
                            last: reason,
                        });
                    }
                    retries += 1;
                    let delay = self.retry.next_delay(retries);
                    warn!(
                        "insert into {} failed ({}); retry {}/{} in {:?}",
                        table, reason, retries, num_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
