// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Policy knobs shared by all sinks, plus per-backend connection settings.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use reqwest::Method;

/// Common configuration for all sinks.
///
/// Immutable once handed to a sink. [`Config::default`] carries the
/// documented defaults; construct with struct update syntax to override
/// individual knobs:
///
/// ```
/// use logship::Config;
///
/// let config = Config {
///     max_batch_size: 50,
///     drop_on_full: true,
///     ..Config::default()
/// };
/// assert_eq!(config.buffer_size, 1000);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Service metadata attached to label sets by the Loki sink.
    pub service_name: String,
    pub instance_id: String,
    pub environment: String,

    /// Number of entries resident in the buffer before the overflow policy
    /// triggers.
    pub buffer_size: usize,
    /// Period of the background flush task.
    pub flush_interval: Duration,
    /// Maximum number of entries in a single transport call.
    pub max_batch_size: usize,

    /// Maximum number of retry attempts beyond the first.
    pub max_retries: u32,
    /// Initial retry interval, doubled after each failed attempt.
    pub retry_interval: Duration,

    /// Connection timeout.
    pub conn_timeout: Duration,
    /// Write operation timeout, bounding each delivery attempt.
    pub write_timeout: Duration,

    /// Concurrency hint for transport calls.
    pub worker_pool_size: usize,

    /// Drop entries instead of flushing synchronously when the buffer is full.
    pub drop_on_full: bool,
    /// Write entries asynchronously.
    pub async_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_name: "unknown".to_string(),
            instance_id: String::new(),
            environment: "development".to_string(),
            buffer_size: 1000,
            flush_interval: Duration::from_secs(5),
            max_batch_size: 100,
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            conn_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            worker_pool_size: 2,
            drop_on_full: false,
            async_write: true,
        }
    }
}

/// HTTP basic authentication credentials.
#[derive(Clone, Debug)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Configuration for [`HttpSink`](crate::HttpSink).
#[derive(Clone, Debug)]
pub struct HttpSinkConfig {
    pub config: Config,
    /// Destination endpoint URL. Required.
    pub url: String,
    /// HTTP method used for every request.
    pub method: Method,
    /// Additional static headers applied to every request.
    pub headers: HashMap<String, String>,
    /// Content-Type header value.
    pub content_type: String,
    /// Bearer token, preferred over `basic_auth` when both are set.
    pub bearer_token: Option<String>,
    pub basic_auth: Option<BasicAuth>,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        HttpSinkConfig {
            config: Config::default(),
            url: String::new(),
            method: Method::POST,
            headers: HashMap::new(),
            content_type: "application/json".to_string(),
            bearer_token: None,
            basic_auth: None,
        }
    }
}

/// Configuration for [`LokiSink`](crate::LokiSink).
#[derive(Clone, Debug, Default)]
pub struct LokiSinkConfig {
    pub config: Config,
    /// Loki push API URL, e.g. `http://loki:3100/loki/api/v1/push`. Required.
    pub url: String,
    /// Tenant id sent as `X-Scope-OrgID` when set.
    pub tenant_id: Option<String>,
    /// Static labels applied to every stream. Seeded at construction with
    /// `service`, `environment`, and `instance` from the service metadata
    /// unless those labels are already present.
    pub labels: BTreeMap<String, String>,
    pub bearer_token: Option<String>,
    pub basic_auth: Option<BasicAuth>,
}
