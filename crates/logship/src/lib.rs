// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! Buffered, batching delivery of structured log records to remote
//! collectors, without blocking the caller and without losing data under
//! transient network failure.
//!
//! ## Overview
//!
//! A [`BufferedSink`] wraps any transport implementing [`Sink`] with an
//! in-memory queue, a flush policy (size threshold, timer, explicit call,
//! shutdown), retrying delivery with exponential backoff, and
//! sent/dropped/buffered counters. Two transports ship with the crate:
//!
//! - [`HttpSink`]: one `{"logs":[...]}` JSON envelope per batch, POSTed to a
//!   generic ingestion endpoint
//! - [`LokiSink`]: batches partitioned into label-grouped streams for the
//!   Grafana Loki push API
//!
//! Fan-out is composition: give each destination its own pipeline.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use logship::{BufferedSink, Config, HttpSink, HttpSinkConfig, Level, LogEntry};
//!
//! # async fn run() -> Result<(), logship::SinkError> {
//! let transport = HttpSink::new(HttpSinkConfig {
//!     url: "https://logs.example.com/ingest".to_string(),
//!     bearer_token: Some("token".to_string()),
//!     ..HttpSinkConfig::default()
//! })?;
//!
//! let pipeline = BufferedSink::new(Arc::new(transport), Config::default());
//! pipeline.write(LogEntry::new(Level::Info, "service started")).await?;
//! // ...
//! pipeline.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]

/// Buffering, batching, and retrying delivery pipeline
pub mod buffer;

/// Sink configuration and defaults
pub mod config;

/// The wire-agnostic log record
pub mod entry;

/// Generic HTTP JSON transport
pub mod http;

/// Label-grouped streaming transport for Grafana Loki
pub mod loki;

/// The sink capability contract and error taxonomy
pub mod sink;

pub use buffer::{BufferedSink, SinkStats};
pub use config::{BasicAuth, Config, HttpSinkConfig, LokiSinkConfig};
pub use entry::{Level, LogEntry};
pub use http::HttpSink;
pub use loki::LokiSink;
pub use sink::{Sink, SinkError, SinkHealth};
