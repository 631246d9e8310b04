//! HttpJsonAdapter - generic JSON-over-HTTP source adapter.
//!
//! GET `url_template` with `{entity}` replaced by the percent-encoded entity ref. A JSON
//! array becomes one record per element, anything else a single record.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SourceConfig;
use crate::domain::{SourceId, Task, TaskError};
use crate::ports::{FetchOutput, SourceAdapter};

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const ENTITY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct HttpJsonAdapter {
    source: SourceId,
    url_template: String,
    client: Client,
}

impl HttpJsonAdapter {
    pub fn new(source: SourceId, url_template: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            source,
            url_template: url_template.into(),
            client,
        }
    }

    /// Adapter for a configured source, if it has a `url_template`.
    pub fn from_config(name: &str, config: &SourceConfig, timeout: Duration) -> Option<Self> {
        config
            .url_template
            .as_ref()
            .map(|template| Self::new(SourceId::new(name), template.clone(), timeout))
    }

    pub fn url_for(&self, task: &Task) -> String {
        let entity = utf8_percent_encode(task.entity_ref.as_str(), ENTITY).to_string();
        self.url_template.replace("{entity}", &entity)
    }

    async fn get(&self, url: &str) -> Result<FetchOutput, TaskError> {
        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TaskError::permanent(format!("response is not JSON: {e}")))?;
        let records = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        Ok(FetchOutput::new(records))
    }
}

fn classify(e: reqwest::Error) -> TaskError {
    if e.is_builder() {
        TaskError::permanent(format!("invalid request: {e}"))
    } else {
        TaskError::recoverable(format!("request failed: {e}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> TaskError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {snippet}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        TaskError::recoverable(message)
    } else {
        TaskError::permanent(message)
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonAdapter {
    fn source(&self) -> &SourceId {
        &self.source
    }

    async fn fetch(&self, task: &Task, cancel: CancellationToken) -> Result<FetchOutput, TaskError> {
        let url = self.url_for(task);
        debug!(task_id = %task.id, url = %url, "http fetch");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::recoverable("fetch cancelled")),
            result = self.get(&url) => result,
        }
    }
}
