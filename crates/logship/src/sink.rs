// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capability contract every log destination satisfies.
//!
//! Concrete backends ([`HttpSink`](crate::HttpSink),
//! [`LokiSink`](crate::LokiSink)) and the buffering layer
//! ([`BufferedSink`](crate::BufferedSink)) all implement [`Sink`], so
//! pipelines layer transparently over any destination, including custom
//! ones. Backends share no implementation, only this contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::entry::LogEntry;

/// Errors surfaced by sink construction and delivery.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Required configuration is missing or invalid. Construction-time only.
    #[error("invalid sink configuration: {0}")]
    Config(String),

    /// A payload could not be serialized.
    #[error("failed to marshal logs: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The request never produced a response.
    #[error("failed to send logs: {0}")]
    Network(#[from] reqwest::Error),

    /// The destination answered with a non-2xx status.
    #[error("HTTP error: {status} {status_text} - {body}")]
    Status {
        status: u16,
        status_text: String,
        body: String,
    },

    /// A single delivery attempt exceeded the write timeout.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Pluggable log destination.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sends a single log entry to the sink.
    async fn write(&self, entry: LogEntry) -> Result<(), SinkError>;

    /// Sends multiple log entries in a batch.
    async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError>;

    /// Ensures all buffered logs are sent. A no-op for unbuffered backends.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Gracefully shuts down the sink.
    async fn close(&self) -> Result<(), SinkError>;

    /// Whether the last delivery succeeded.
    fn is_healthy(&self) -> bool;

    /// Message of the most recent delivery error, if any.
    fn last_error(&self) -> Option<String>;
}

/// Rolling health state owned by a single sink instance.
///
/// A coarse last-call-outcome signal, not a moving average: any failure
/// flips the flag to unhealthy, any success flips it back.
#[derive(Debug)]
pub struct SinkHealth {
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl SinkHealth {
    /// New sinks start healthy; nothing has failed yet.
    #[must_use]
    pub fn new() -> Self {
        SinkHealth {
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_success(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    #[allow(clippy::expect_used)]
    pub fn record_error(&self, err: &SinkError) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.last_error.lock().expect("lock poisoned") = Some(err.to_string());
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock poisoned").clone()
    }
}

impl Default for SinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_starts_healthy_with_no_error() {
        let health = SinkHealth::new();
        assert!(health.is_healthy());
        assert!(health.last_error().is_none());
    }

    #[test]
    fn test_health_flips_on_error_and_back_on_success() {
        let health = SinkHealth::new();

        health.record_error(&SinkError::Config("URL is required".to_string()));
        assert!(!health.is_healthy());
        assert_eq!(
            health.last_error().as_deref(),
            Some("invalid sink configuration: URL is required")
        );

        health.record_success();
        assert!(health.is_healthy());
        // the last error is retained for inspection after recovery
        assert!(health.last_error().is_some());
    }

    #[test]
    fn test_status_error_embeds_status_and_body() {
        let err = SinkError::Status {
            status: 503,
            status_text: "Service Unavailable".to_string(),
            body: "try again later".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("Service Unavailable"));
        assert!(message.contains("try again later"));
    }
}
