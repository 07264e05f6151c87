// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire formats: the versioned protobuf schema used for archive uploads and
//! on-disk batches, and the JSON envelope used on the live channel.

use std::collections::{BTreeMap, HashMap};

use prost::bytes::Buf;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::record::{ApplicationInfo, Batch, LogLevel, LogRecord, SourceLocation};

pub const SCHEMA_VERSION: u32 = 1;
pub const LIVE_BATCH_MESSAGE_TYPE: &str = "v0/logMessageBatch";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Priority {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Priority {
    pub fn wire_name(self) -> &'static str {
        match self {
            Priority::Debug => "DEBUG",
            Priority::Info => "INFO",
            Priority::Warn => "WARN",
            Priority::Error => "ERROR",
        }
    }
}

impl From<LogLevel> for Priority {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Verbose | LogLevel::Debug => Priority::Debug,
            LogLevel::Info => Priority::Info,
            LogLevel::Warning => Priority::Warn,
            LogLevel::Error | LogLevel::Critical => Priority::Error,
        }
    }
}

impl From<Priority> for LogLevel {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Debug => LogLevel::Debug,
            Priority::Info => LogLevel::Info,
            Priority::Warn => LogLevel::Warning,
            Priority::Error => LogLevel::Error,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct WireRecord {
    #[prost(uint64, tag = "1")]
    pub position: u64,
    #[prost(enumeration = "Priority", tag = "2")]
    pub priority: i32,
    #[prost(string, tag = "3")]
    pub label: String,
    #[prost(string, tag = "4")]
    pub body: String,
    #[prost(string, tag = "5")]
    pub source: String,
    #[prost(uint64, tag = "6")]
    pub timestamp_millis: u64,
    #[prost(map = "string, string", tag = "7")]
    pub meta: HashMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireBatch {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,
    #[prost(string, tag = "2")]
    pub batch_id: String,
    #[prost(message, repeated, tag = "3")]
    pub records: Vec<WireRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SenderRegistration {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,
    #[prost(string, tag = "2")]
    pub secret: String,
    #[prost(string, tag = "3")]
    pub app_id: String,
    #[prost(string, tag = "4")]
    pub app_version: String,
    #[prost(string, tag = "5")]
    pub app_build: String,
    #[prost(string, tag = "6")]
    pub os: String,
    #[prost(string, tag = "7")]
    pub device_model: String,
    #[prost(string, tag = "8")]
    pub device_id: String,
}

impl SenderRegistration {
    pub fn new(secret: &str, app: &ApplicationInfo) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            secret: secret.to_string(),
            app_id: app.app_id.clone(),
            app_version: app.version.clone(),
            app_build: app.build.clone(),
            os: app.os.clone(),
            device_model: app.device_model.clone(),
            device_id: app.device_id.clone(),
        }
    }
}

impl From<&LogRecord> for WireRecord {
    fn from(record: &LogRecord) -> Self {
        WireRecord {
            position: record.position,
            priority: Priority::from(record.level) as i32,
            label: record.label.clone(),
            body: record.message.clone(),
            source: record
                .source
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            timestamp_millis: record.timestamp_millis(),
            meta: record.meta.clone().unwrap_or_default(),
        }
    }
}

impl From<WireRecord> for LogRecord {
    fn from(wire: WireRecord) -> Self {
        LogRecord {
            position: wire.position,
            timestamp: wire.timestamp_millis as f64 / 1000.0,
            level: wire.priority().into(),
            message: wire.body,
            label: wire.label,
            meta: if wire.meta.is_empty() {
                None
            } else {
                Some(wire.meta)
            },
            source: SourceLocation::parse(&wire.source),
        }
    }
}

pub fn encode_batch(batch: &Batch) -> Vec<u8> {
    WireBatch {
        schema_version: SCHEMA_VERSION,
        batch_id: batch.id.clone(),
        records: batch.records.iter().map(WireRecord::from).collect(),
    }
    .encode_to_vec()
}

pub fn decode_batch(bytes: &[u8]) -> Result<Batch, TransportError> {
    let wire = WireBatch::decode(bytes).map_err(TransportError::serialization)?;
    if wire.schema_version != SCHEMA_VERSION {
        return Err(TransportError::Serialization(format!(
            "unsupported schema version {}",
            wire.schema_version
        )));
    }
    Ok(Batch::new(
        wire.batch_id,
        wire.records.into_iter().map(LogRecord::from).collect(),
    ))
}

/// Appends one length-delimited record, the unit of the on-disk batch format.
pub fn encode_record_frame(record: &LogRecord, out: &mut Vec<u8>) {
    // Encoding into a Vec only fails on insufficient capacity, which Vec never reports.
    let _ = WireRecord::from(record).encode_length_delimited(out);
}

/// Decodes consecutive record frames. A damaged tail (for example a write cut
/// short by a crash) stops decoding; the intact prefix is returned with the error.
pub fn decode_record_frames(bytes: &[u8]) -> (Vec<LogRecord>, Option<prost::DecodeError>) {
    let mut buf = bytes;
    let mut records = Vec::new();
    while buf.has_remaining() {
        match WireRecord::decode_length_delimited(&mut buf) {
            Ok(wire) => records.push(wire.into()),
            Err(e) => return (records, Some(e)),
        }
    }
    (records, None)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRecord {
    pub position: u64,
    pub priority: String,
    pub label: String,
    pub body: String,
    pub source: String,
    pub timestamp_millis: u64,
    pub meta: BTreeMap<String, String>,
}

impl From<&LogRecord> for JsonRecord {
    fn from(record: &LogRecord) -> Self {
        JsonRecord {
            position: record.position,
            priority: Priority::from(record.level).wire_name().to_string(),
            label: record.label.clone(),
            body: record.message.clone(),
            source: record
                .source
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            timestamp_millis: record.timestamp_millis(),
            meta: record
                .meta
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: LivePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePayload {
    pub sender_id: String,
    pub messages: Vec<JsonRecord>,
}

pub fn encode_live_envelope(
    sender_id: &str,
    records: &[LogRecord],
) -> Result<String, TransportError> {
    let envelope = LiveEnvelope {
        kind: LIVE_BATCH_MESSAGE_TYPE.to_string(),
        payload: LivePayload {
            sender_id: sender_id.to_string(),
            messages: records.iter().map(JsonRecord::from).collect(),
        },
    };
    serde_json::to_string(&envelope).map_err(TransportError::serialization)
}
