// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic HTTP JSON transport.
//!
//! Serializes each batch as a single `{"logs":[...]}` envelope and issues
//! one request per batch. Batching, retries, and backoff are the buffering
//! layer's job; this sink attempts exactly one delivery per call.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Config, HttpSinkConfig};
use crate::entry::LogEntry;
use crate::sink::{Sink, SinkError, SinkHealth};

/// Wire envelope for the generic HTTP backend.
#[derive(Serialize)]
struct LogsEnvelope<'a> {
    logs: &'a [LogEntry],
}

/// Builds the shared HTTP client used by the concrete transports.
///
/// The overall request timeout covers connect plus write; pool settings
/// keep a few warm connections per destination host.
pub(crate) fn build_client(config: &Config) -> Result<reqwest::Client, SinkError> {
    reqwest::Client::builder()
        .timeout(config.conn_timeout + config.write_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(5)
        .build()
        .map_err(SinkError::Network)
}

/// Sends logs to a generic HTTP ingestion endpoint.
pub struct HttpSink {
    config: HttpSinkConfig,
    client: reqwest::Client,
    health: SinkHealth,
}

impl HttpSink {
    /// Creates a new HTTP sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] when the destination URL is empty.
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        if config.url.is_empty() {
            return Err(SinkError::Config("URL is required".to_string()));
        }
        let client = build_client(&config.config)?;
        Ok(HttpSink {
            config,
            client,
            health: SinkHealth::new(),
        })
    }

    fn record_error(&self, err: SinkError) -> SinkError {
        self.health.record_error(&err);
        err
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
        self.write_batch(std::slice::from_ref(&entry)).await
    }

    async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let payload = match serde_json::to_vec(&LogsEnvelope { logs: entries }) {
            Ok(payload) => payload,
            Err(e) => return Err(self.record_error(SinkError::Serialize(e))),
        };

        let mut request = self
            .client
            .request(self.config.method.clone(), &self.config.url)
            .header(reqwest::header::CONTENT_TYPE, &self.config.content_type);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        } else if let Some(basic) = &self.config.basic_auth {
            request = request.basic_auth(&basic.username, Some(&basic.password));
        }

        let response = match request.body(payload).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.record_error(SinkError::Network(e))),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.record_error(SinkError::Status {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                body,
            }));
        }

        self.health.record_success();
        Ok(())
    }

    // batching is handled by the buffering layer
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    // the connection pool is torn down when the client is dropped
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    fn last_error(&self) -> Option<String> {
        self.health.last_error()
    }
}
