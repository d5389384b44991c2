//! Codec layer
//!
//! Every codec turns a [`Message`] into bytes and back behind the
//! [`MessageCodec`] contract:
//!
//! - [`JsonCodec`]: UTF-8 text, configurable date policy, optional pretty printing
//! - [`AvroCodec`]: schema-based binary, data encoded against a registered Avro schema
//! - [`CompactCodec`]: self-describing binary tags, no schema needed
//!
//! All of them share the same decode pipeline: size bound, optional
//! decompression, size bound again, parse, required-field check, integrity check.

pub mod avro;
pub mod compact;
pub mod compression;
pub mod extended;
pub mod json;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::checksum::Checksum;
use crate::config::CodecConfig;
use crate::envelope::Message;
use crate::error::{ExchangeError, Result};
use crate::registry::SchemaRegistry;

pub use avro::AvroCodec;
pub use compact::CompactCodec;
pub use compression::{CompressionAlgorithm, CompressionSettings, CompressionStage, Compressor, StandardCompressor};
pub use extended::ExtendedValue;
pub use json::{DateFormat, DateFormatter, DatePolicy, JsonCodec};

/// Default upper bound for an encoded or decoded message (10 MiB)
pub const DEFAULT_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Fields every decoded message must carry, as JSON pointers into the wire object
const REQUIRED_FIELDS: [(&str, &str); 3] = [
    ("/envelope/header/message_id", "envelope.header.message_id"),
    ("/envelope/header/timestamp", "envelope.header.timestamp"),
    ("/payload/schema_version", "payload.schema_version"),
];

/// Wire format of a codec, used for negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    Json,
    Avro,
    Compact,
}

impl SerializationFormat {
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::Avro => "avro",
            SerializationFormat::Compact => "compact",
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SerializationFormat {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(SerializationFormat::Json),
            "avro" | "binary" => Ok(SerializationFormat::Avro),
            "compact" => Ok(SerializationFormat::Compact),
            other => Err(ExchangeError::Config(format!("unknown serialization format '{}'", other))),
        }
    }
}

/// Output of [`MessageCodec::serialize`]
#[derive(Debug, Clone)]
pub struct SerializationResult {
    pub bytes: Vec<u8>,
    /// Encoded size before compression
    pub original_size: usize,
    /// Size on the wire
    pub compressed_size: usize,
    /// `original_size / compressed_size`; exactly 1 when sent uncompressed
    pub compression_ratio: f64,
    pub format: SerializationFormat,
    /// Compression actually applied
    pub compression: CompressionAlgorithm,
    /// CRC32 of `bytes` (schema-based binary codec only)
    pub crc32: Option<u32>,
    /// SHA-256 of `bytes` (schema-based binary codec only)
    pub content_hash: Option<Checksum>,
}

/// Shared codec contract
pub trait MessageCodec: Send + Sync {
    /// Format produced by this codec
    fn format(&self) -> SerializationFormat;

    /// Encode a message
    fn serialize(&self, message: &Message) -> Result<SerializationResult>;

    /// Decode and re-validate a message
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

/// Build a codec for `format`. The schema-based codec needs a registry and a type name.
pub fn build_codec(
    format: SerializationFormat,
    config: &CodecConfig,
    schema: Option<(Arc<SchemaRegistry>, String)>,
) -> Result<Box<dyn MessageCodec>> {
    match format {
        SerializationFormat::Json => Ok(Box::new(JsonCodec::new(config.clone()))),
        SerializationFormat::Compact => Ok(Box::new(CompactCodec::new(config.clone()))),
        SerializationFormat::Avro => {
            let (registry, type_name) = schema.ok_or_else(|| {
                ExchangeError::Config("the avro codec needs a schema registry and a type name".to_string())
            })?;
            Ok(Box::new(AvroCodec::new(registry, type_name, config.clone())))
        }
    }
}

pub(crate) fn check_size(size: usize, limit: usize) -> Result<()> {
    if size > limit {
        return Err(ExchangeError::SizeLimitExceeded { size, limit });
    }
    Ok(())
}

/// Bound, compress and describe an encoded body
pub(crate) fn finish_encode(
    body: Vec<u8>,
    format: SerializationFormat,
    stage: &CompressionStage,
    max_size: usize,
) -> Result<SerializationResult> {
    check_size(body.len(), max_size)?;
    let original_size = body.len();
    let compressed = stage.apply(body);
    let compressed_size = compressed.bytes.len();
    let compression_ratio = if compressed.algorithm == CompressionAlgorithm::None || compressed_size == 0 {
        1.0
    } else {
        original_size as f64 / compressed_size as f64
    };
    Ok(SerializationResult {
        bytes: compressed.bytes,
        original_size,
        compressed_size,
        compression_ratio,
        format,
        compression: compressed.algorithm,
        crc32: None,
        content_hash: None,
    })
}

/// Bound and decompress an incoming buffer
pub(crate) fn open_frame<'a>(bytes: &'a [u8], stage: &CompressionStage, max_size: usize) -> Result<Cow<'a, [u8]>> {
    check_size(bytes.len(), max_size)?;
    let (body, _) = stage.strip(bytes, max_size)?;
    check_size(body.len(), max_size)?;
    Ok(body)
}

/// Structural check on the wire object before it becomes a [`Message`]
pub(crate) fn require_fields(wire: &Value) -> Result<()> {
    for (pointer, field) in REQUIRED_FIELDS {
        match wire.pointer(pointer) {
            None | Some(Value::Null) => return Err(ExchangeError::missing(field)),
            Some(_) => {}
        }
    }
    Ok(())
}

/// Integrity check of a decoded message
pub(crate) fn check_integrity(message: &Message, require_checksum: bool) -> Result<()> {
    if require_checksum && message.payload().checksum().is_none() {
        warn!(message_id = %message.message_id(), "rejecting message without checksum");
        return Err(ExchangeError::MissingChecksum);
    }
    message.verify_integrity().map_err(|e| {
        warn!(message_id = %message.message_id(), error = %e, "payload failed integrity check");
        e
    })
}

/// `message` with tagged dates in canonical text and the checksum recomputed.
///
/// Codecs that rewrite dates on the wire send this form so the decoded payload
/// still verifies.
pub(crate) fn with_canonical_dates(message: &Message) -> Cow<'_, Message> {
    match extended::canonical_dates(message.data()) {
        Some(data) => {
            debug!(message_id = %message.message_id(), "tagged dates normalized to canonical text");
            Cow::Owned(message.with_data(data))
        }
        None => Cow::Borrowed(message),
    }
}

/// Turn the validated wire object into a message and verify it
pub(crate) fn into_message(wire: Value, config: &CodecConfig) -> Result<Message> {
    require_fields(&wire)?;
    let message: Message = serde_json::from_value(wire)?;
    check_integrity(&message, config.require_checksum)?;
    Ok(message)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use crate::clock::FixedClock;
    use crate::envelope::{Message, MessageDraft, MessagePriority, MessageType};

    pub fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    pub fn order_data() -> Value {
        json!({
            "order_id": 42,
            "customer": "ada",
            "total": 99.5,
            "status": "PENDING",
            "lines": [{"sku": "A-1", "qty": 2}, {"sku": "B-7", "qty": 1}],
            "note": null
        })
    }

    pub fn message_with(data: Value) -> Message {
        let clock = clock();
        let mut draft = MessageDraft::new("orders", "1.0.0", data);
        draft.destination = Some("billing".to_string());
        draft.message_type = Some(MessageType::Event);
        draft.priority = Some(MessagePriority::High);
        draft.ttl_ms = Some(60_000);
        draft.tags = vec!["checkout".to_string()];
        draft.trace_id = Some("trace-42".to_string());
        draft.delay_until = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap());
        draft.custom.insert("tenant".to_string(), json!("acme"));
        draft.build(&clock).unwrap()
    }

    pub fn order_message() -> Message {
        message_with(order_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_fields_names_missing_field() {
        let wire = json!({
            "envelope": {"header": {"message_id": "x", "timestamp": "t"}},
            "payload": {"data": {}}
        });
        match require_fields(&wire) {
            Err(ExchangeError::MissingField { field }) => assert_eq!(field, "payload.schema_version"),
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn test_format_negotiation_names() {
        for format in [SerializationFormat::Json, SerializationFormat::Avro, SerializationFormat::Compact] {
            assert_eq!(format.name().parse::<SerializationFormat>().unwrap(), format);
        }
        assert!("xml".parse::<SerializationFormat>().is_err());
    }

    #[test]
    fn test_build_codec_requires_registry_for_avro() {
        let config = CodecConfig::default();
        assert!(build_codec(SerializationFormat::Avro, &config, None).is_err());
        let codec = build_codec(SerializationFormat::Compact, &config, None).unwrap();
        assert_eq!(codec.format(), SerializationFormat::Compact);
    }
}
