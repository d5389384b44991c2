//! Text codec
//!
//! Wire object:
//!
//! ```text
//! {
//!   "envelope": {"header": {...}, "metadata": {...}},
//!   "payload": {"data": ..., "schema_version": "1.0.0", "checksum": "...",
//!               "size_bytes": 42, "encoding": "json", "compression": "none"}
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::compression::CompressionStage;
use super::extended::{format_date, malformed, parse_date, visit_dates};
use super::{
    finish_encode, into_message, open_frame, require_fields, with_canonical_dates, MessageCodec, SerializationFormat,
    SerializationResult,
};
use crate::config::CodecConfig;
use crate::envelope::Message;
use crate::error::Result;

/// Envelope date fields subject to the date policy
const DATE_FIELDS: [&str; 2] = ["/envelope/header/timestamp", "/envelope/metadata/delay_until"];

/// Date representation selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    #[default]
    Iso8601,
    EpochMillis,
}

/// Caller-supplied date representation
pub trait DateFormatter: Send + Sync {
    fn format(&self, date: &DateTime<Utc>) -> Value;
    fn parse(&self, value: &Value) -> Option<DateTime<Utc>>;
}

/// How dates are written on the wire. Applied on encode, reversed on decode.
#[derive(Clone)]
pub enum DatePolicy {
    Iso8601,
    EpochMillis,
    Custom(Arc<dyn DateFormatter>),
}

impl fmt::Debug for DatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatePolicy::Iso8601 => f.write_str("Iso8601"),
            DatePolicy::EpochMillis => f.write_str("EpochMillis"),
            DatePolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl From<DateFormat> for DatePolicy {
    fn from(format: DateFormat) -> Self {
        match format {
            DateFormat::Iso8601 => DatePolicy::Iso8601,
            DateFormat::EpochMillis => DatePolicy::EpochMillis,
        }
    }
}

impl DatePolicy {
    fn format(&self, date: &DateTime<Utc>) -> Value {
        match self {
            DatePolicy::Iso8601 => Value::String(format_date(date)),
            DatePolicy::EpochMillis => Value::from(date.timestamp_millis()),
            DatePolicy::Custom(formatter) => formatter.format(date),
        }
    }

    fn parse(&self, value: &Value) -> Option<DateTime<Utc>> {
        match self {
            DatePolicy::Iso8601 => value.as_str().and_then(parse_date),
            DatePolicy::EpochMillis => value
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            DatePolicy::Custom(formatter) => formatter.parse(value),
        }
    }

    /// Dates are already ISO-8601 in the serde form; nothing to rewrite
    fn is_native(&self) -> bool {
        matches!(self, DatePolicy::Iso8601)
    }
}

/// UTF-8 JSON codec
#[derive(Debug, Clone)]
pub struct JsonCodec {
    config: CodecConfig,
    dates: DatePolicy,
    stage: CompressionStage,
}

impl JsonCodec {
    pub fn new(config: CodecConfig) -> Self {
        let dates = DatePolicy::from(config.json.date_format);
        let stage = CompressionStage::new(config.compression.clone());
        Self { config, dates, stage }
    }

    /// Use a caller-supplied date representation
    pub fn with_date_formatter(mut self, formatter: Arc<dyn DateFormatter>) -> Self {
        self.dates = DatePolicy::Custom(formatter);
        self
    }

    /// Replace the compression stage, e.g. to inject a different compressor
    pub fn with_compression_stage(mut self, stage: CompressionStage) -> Self {
        self.stage = stage;
        self
    }

    fn write_dates(&self, wire: &mut Value) -> Result<()> {
        let policy = &self.dates;
        rewrite_dates(wire, &|slot| slot.as_str().and_then(parse_date).map(|date| policy.format(&date)))
    }

    fn read_dates(&self, wire: &mut Value) -> Result<()> {
        let policy = &self.dates;
        rewrite_dates(wire, &|slot| policy.parse(slot).map(|date| Value::String(format_date(&date))))
    }
}

/// Convert envelope dates, which must convert, and tagged dates in payload data,
/// which are left as they are when they do not
fn rewrite_dates(wire: &mut Value, convert: &dyn Fn(&Value) -> Option<Value>) -> Result<()> {
    for pointer in DATE_FIELDS {
        if let Some(slot) = wire.pointer_mut(pointer) {
            if !slot.is_null() {
                let converted = convert(slot).ok_or_else(|| malformed("date", &*slot))?;
                *slot = converted;
            }
        }
    }
    if let Some(data) = wire.pointer_mut("/payload/data") {
        visit_dates(data, &mut |slot| {
            if let Some(converted) = convert(slot) {
                *slot = converted;
            }
        });
    }
    Ok(())
}

impl MessageCodec for JsonCodec {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn serialize(&self, message: &Message) -> Result<SerializationResult> {
        let wire = if self.dates.is_native() {
            serde_json::to_value(message)?
        } else {
            let mut wire = serde_json::to_value(with_canonical_dates(message).as_ref())?;
            self.write_dates(&mut wire)?;
            wire
        };
        let body = if self.config.json.pretty {
            serde_json::to_vec_pretty(&wire)?
        } else {
            serde_json::to_vec(&wire)?
        };
        finish_encode(body, SerializationFormat::Json, &self.stage, self.config.max_size)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        let body = open_frame(bytes, &self.stage, self.config.max_size)?;
        let mut wire: Value = serde_json::from_slice(&body)?;
        require_fields(&wire)?;
        if !self.dates.is_native() {
            self.read_dates(&mut wire)?;
        }
        into_message(wire, &self.config)
    }
}
