// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The immutable record model shared by every pipeline stage.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub function: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, function: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            function: function.into(),
            line,
        }
    }

    /// Parses the `file:function:line` wire form. The function part may itself
    /// contain colons, so the line is taken from the right and the file from the left.
    pub fn parse(value: &str) -> Option<Self> {
        let (rest, line) = value.rsplit_once(':')?;
        let (file, function) = rest.split_once(':')?;
        Some(Self {
            file: file.to_string(),
            function: function.to_string(),
            line: line.parse().ok()?,
        })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.function, self.line)
    }
}

/// One logged event after redaction, ready for transport. Never mutated after
/// construction; buffers clone it when they need to hand it out twice.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub position: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub level: LogLevel,
    pub message: String,
    pub label: String,
    pub meta: Option<HashMap<String, String>>,
    pub source: Option<SourceLocation>,
}

impl LogRecord {
    pub fn timestamp_millis(&self) -> u64 {
        if self.timestamp <= 0.0 {
            return 0;
        }
        (self.timestamp * 1000.0).round() as u64
    }
}

pub type BatchId = String;

/// A unit of acknowledgment. Buffers decide the boundaries; nothing downstream
/// splits or merges batches.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub records: Vec<LogRecord>,
}

impl Batch {
    pub fn new(id: impl Into<BatchId>, records: Vec<LogRecord>) -> Self {
        Self {
            id: id.into(),
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Facts about the host application, supplied by the embedding program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub app_id: String,
    pub version: String,
    pub build: String,
    pub os: String,
    pub device_model: String,
    pub device_id: String,
}

impl ApplicationInfo {
    /// The sender id used in envelopes and discovery announcements.
    pub fn sender_id(&self) -> &str {
        &self.device_id
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}
