// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label-grouped streaming transport for Grafana Loki.
//!
//! Each batch is partitioned into streams by derived label set: the static
//! configured labels unioned with `level` and, when present, `hostname`.
//! Every stream carries `[unix_nanos, json_line]` value pairs and all
//! streams of a batch are pushed in a single request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::LokiSinkConfig;
use crate::entry::LogEntry;
use crate::http::build_client;
use crate::sink::{Sink, SinkError, SinkHealth};

/// One log stream: a label set and the values sharing it.
#[derive(Debug, Serialize)]
struct LokiStream {
    stream: BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

/// Push API request body.
#[derive(Debug, Serialize)]
struct LokiPushRequest {
    streams: Vec<LokiStream>,
}

/// Sends logs to a Loki push endpoint.
pub struct LokiSink {
    config: LokiSinkConfig,
    client: reqwest::Client,
    health: SinkHealth,
}

impl LokiSink {
    /// Creates a new Loki sink.
    ///
    /// The static label set is seeded with `service`, `environment`, and
    /// `instance` labels from the service metadata unless already present.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] when the push URL is empty.
    pub fn new(mut config: LokiSinkConfig) -> Result<Self, SinkError> {
        if config.url.is_empty() {
            return Err(SinkError::Config("URL is required".to_string()));
        }

        let base = config.config.clone();
        if !base.service_name.is_empty() {
            config
                .labels
                .entry("service".to_string())
                .or_insert(base.service_name);
        }
        if !base.environment.is_empty() {
            config
                .labels
                .entry("environment".to_string())
                .or_insert(base.environment);
        }
        if !base.instance_id.is_empty() {
            config
                .labels
                .entry("instance".to_string())
                .or_insert(base.instance_id);
        }

        let client = build_client(&config.config)?;
        Ok(LokiSink {
            config,
            client,
            health: SinkHealth::new(),
        })
    }

    /// Label set for one entry: static labels plus the dynamic ones.
    fn build_labels(&self, entry: &LogEntry) -> BTreeMap<String, String> {
        let mut labels = self.config.labels.clone();
        labels.insert("level".to_string(), entry.level.to_string());
        if !entry.hostname.is_empty() {
            labels.insert("hostname".to_string(), entry.hostname.clone());
        }
        labels
    }

    /// Flattens an entry into the single JSON object Loki stores as the line.
    fn format_log_line(entry: &LogEntry) -> Result<String, serde_json::Error> {
        let mut line = serde_json::Map::new();
        line.insert("msg".to_string(), Value::String(entry.message.clone()));
        for (key, value) in &entry.fields {
            line.insert(key.clone(), value.clone());
        }
        if !entry.caller.is_empty() {
            line.insert("caller".to_string(), Value::String(entry.caller.clone()));
        }
        if !entry.stack_trace.is_empty() {
            line.insert(
                "stack_trace".to_string(),
                Value::String(entry.stack_trace.clone()),
            );
        }
        serde_json::to_string(&Value::Object(line))
    }

    /// Partitions a batch into streams, preserving write order within each.
    ///
    /// Grouping by the `BTreeMap` label set itself keeps partitioning
    /// deterministic without serializing labels into a lookup key.
    fn build_streams(&self, entries: &[LogEntry]) -> Result<Vec<LokiStream>, serde_json::Error> {
        let mut streams: BTreeMap<BTreeMap<String, String>, Vec<[String; 2]>> = BTreeMap::new();
        for entry in entries {
            let labels = self.build_labels(entry);
            let timestamp = entry
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string();
            let line = Self::format_log_line(entry)?;
            streams.entry(labels).or_default().push([timestamp, line]);
        }
        Ok(streams
            .into_iter()
            .map(|(stream, values)| LokiStream { stream, values })
            .collect())
    }

    fn record_error(&self, err: SinkError) -> SinkError {
        self.health.record_error(&err);
        err
    }
}

#[async_trait]
impl Sink for LokiSink {
    async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
        self.write_batch(std::slice::from_ref(&entry)).await
    }

    async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let streams = match self.build_streams(entries) {
            Ok(streams) => streams,
            Err(e) => return Err(self.record_error(SinkError::Serialize(e))),
        };
        let payload = match serde_json::to_vec(&LokiPushRequest { streams }) {
            Ok(payload) => payload,
            Err(e) => return Err(self.record_error(SinkError::Serialize(e))),
        };

        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(tenant_id) = &self.config.tenant_id {
            request = request.header("X-Scope-OrgID", tenant_id);
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
