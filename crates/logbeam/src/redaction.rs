// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redaction of raw events under the sensitivity policy.
//!
//! Loggable types describe themselves through [`Loggable`], tagging every field
//! as [`FieldTag::Safe`], [`FieldTag::Sensitive`] or [`FieldTag::Never`]. When
//! the policy is on, sensitive leaves render as [`REDACTED_PLACEHOLDER`] and
//! source locations are stripped. The flag is captured once per record, when
//! the dispatcher buffers it, so flipping the policy later never rewrites
//! records that are already buffered.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::record::{unix_seconds, LogLevel, LogRecord, SourceLocation};

pub const REDACTED_PLACEHOLDER: &str = "<private>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldTag {
    /// Rendered regardless of the policy.
    Safe,
    /// Replaced by the placeholder when the policy is on.
    Sensitive,
    /// Never rendered.
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogField {
    pub name: String,
    pub tag: FieldTag,
    pub value: LogValue,
}

impl LogField {
    pub fn safe(name: impl Into<String>, value: impl Into<LogValue>) -> Self {
        Self::new(name, FieldTag::Safe, value)
    }

    pub fn sensitive(name: impl Into<String>, value: impl Into<LogValue>) -> Self {
        Self::new(name, FieldTag::Sensitive, value)
    }

    pub fn never(name: impl Into<String>, value: impl Into<LogValue>) -> Self {
        Self::new(name, FieldTag::Never, value)
    }

    fn new(name: impl Into<String>, tag: FieldTag, value: impl Into<LogValue>) -> Self {
        Self {
            name: name.into(),
            tag,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Text(String),
    List(Vec<LogValue>),
    Struct {
        type_name: String,
        fields: Vec<LogField>,
    },
}

/// Implemented by types that can appear in log messages or metadata.
pub trait Loggable {
    fn type_name(&self) -> &str;

    fn log_fields(&self) -> Vec<LogField>;

    fn to_log_value(&self) -> LogValue {
        LogValue::Struct {
            type_name: self.type_name().to_string(),
            fields: self.log_fields(),
        }
    }
}

impl LogValue {
    pub fn from_loggable(value: &dyn Loggable) -> Self {
        value.to_log_value()
    }

    fn render_into(&self, tag: FieldTag, sensitive: bool, out: &mut String) {
        match self {
            LogValue::Text(text) => {
                if tag == FieldTag::Safe || !sensitive {
                    out.push_str(text);
                } else {
                    out.push_str(REDACTED_PLACEHOLDER);
                }
            }
            LogValue::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(tag, sensitive, out);
                }
                out.push(']');
            }
            // Struct fields carry their own tags.
            LogValue::Struct { type_name, fields } => {
                out.push_str(type_name);
                out.push('(');
                let mut first = true;
                for field in fields.iter().filter(|f| f.tag != FieldTag::Never) {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    out.push_str(&field.name);
                    out.push_str(": ");
                    field.value.render_into(field.tag, sensitive, out);
                }
                out.push(')');
            }
        }
    }

    pub fn render(&self, tag: FieldTag, sensitive: bool) -> String {
        if tag == FieldTag::Never {
            return String::new();
        }
        let mut out = String::new();
        self.render_into(tag, sensitive, &mut out);
        out
    }
}

macro_rules! text_value_from {
    ($($t:ty),*) => {
        $(impl From<$t> for LogValue {
            fn from(value: $t) -> Self {
                LogValue::Text(value.to_string())
            }
        })*
    };
}

text_value_from!(&str, String, &String, bool, char, i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl<T: Into<LogValue>> From<Vec<T>> for LogValue {
    fn from(values: Vec<T>) -> Self {
        LogValue::List(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Value(LogValue, FieldTag),
}

/// A message assembled from literal text and interpolated values. Literals are
/// safe; interpolated values are sensitive unless added with [`LogMessage::safe`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogMessage {
    segments: Vec<Segment>,
}

impl LogMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal(mut self, text: impl Into<String>) -> Self {
        self.segments.push(Segment::Literal(text.into()));
        self
    }

    pub fn value(mut self, value: impl Into<LogValue>) -> Self {
        self.segments
            .push(Segment::Value(value.into(), FieldTag::Sensitive));
        self
    }

    pub fn safe(mut self, value: impl Into<LogValue>) -> Self {
        self.segments.push(Segment::Value(value.into(), FieldTag::Safe));
        self
    }

    pub fn loggable(self, value: &dyn Loggable) -> Self {
        self.value(value.to_log_value())
    }

    pub fn render(&self, sensitive: bool) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(value, tag) => value.render_into(*tag, sensitive, &mut out),
            }
        }
        out
    }
}

impl From<&str> for LogMessage {
    fn from(text: &str) -> Self {
        LogMessage::new().literal(text)
    }
}

impl From<String> for LogMessage {
    fn from(text: String) -> Self {
        LogMessage::new().literal(text)
    }
}

/// A raw event as produced at the call site, before redaction.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub time: SystemTime,
    pub level: LogLevel,
    pub label: String,
    pub message: LogMessage,
    pub meta: Vec<(String, FieldTag, LogValue)>,
    pub source: Option<SourceLocation>,
}

impl LogEvent {
    pub fn new(level: LogLevel, label: impl Into<String>, message: impl Into<LogMessage>) -> Self {
        Self {
            time: SystemTime::now(),
            level,
            label: label.into(),
            message: message.into(),
            meta: Vec::new(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<LogValue>) -> Self {
        self.meta
            .push((key.into(), FieldTag::Sensitive, value.into()));
        self
    }

    #[must_use]
    pub fn with_safe_meta(mut self, key: impl Into<String>, value: impl Into<LogValue>) -> Self {
        self.meta.push((key.into(), FieldTag::Safe, value.into()));
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: SourceLocation) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn at(mut self, time: SystemTime) -> Self {
        self.time = time;
        self
    }
}

/// Renders `event` into a record under the given policy. Infallible.
pub fn redact(event: LogEvent, position: u64, sensitive: bool) -> LogRecord {
    let meta: HashMap<String, String> = event
        .meta
        .iter()
        .filter(|(_, tag, _)| *tag != FieldTag::Never)
        .map(|(key, tag, value)| (key.clone(), value.render(*tag, sensitive)))
        .collect();

    LogRecord {
        position,
        timestamp: unix_seconds(event.time),
        level: event.level,
        message: event.message.render(sensitive),
        label: event.label,
        meta: if meta.is_empty() { None } else { Some(meta) },
        source: if sensitive { None } else { event.source },
    }
}
