// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The wire-agnostic log record accepted by every sink.
//!
//! A [`LogEntry`] is produced by a structured-logging facade and handed to a
//! sink as-is; nothing in this crate mutates an entry after creation. The
//! serde representation doubles as the generic HTTP wire format (snake_case
//! keys, empty optional fields omitted).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Log severity, serialized as lowercase text on every wire format.
///
/// The variants mirror the levels emitted by the common structured-logging
/// facades; anything more granular is collapsed by the facade before an entry
/// reaches a sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Panic,
    Fatal,
}

impl Level {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Panic => "panic",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses levels from strings with case-insensitive matching.
impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "panic" => Ok(Level::Panic),
            "fatal" => Ok(Level::Fatal),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: debug, info, warn, error, panic, fatal",
            )),
        }
    }
}

/// A single structured log record.
///
/// Field values are open, heterogeneous [`serde_json::Value`]s so the facade
/// can attach booleans, numbers, text, or nested structures without the sink
/// caring. Keys are unique; insertion order is irrelevant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Nanosecond-resolution instant the record was produced.
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, Value>,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Call-site location, e.g. `server.rs:42`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caller: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack_trace: String,
}

impl LogEntry {
    /// Creates an entry stamped with the current time and no provenance.
    ///
    /// The remaining fields are public; facades populate them directly.
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields: HashMap::new(),
            service_name: String::new(),
            instance_id: String::new(),
            environment: String::new(),
            hostname: String::new(),
            caller: String::new(),
            stack_trace: String::new(),
        }
    }
}
