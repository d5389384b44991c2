//! Schema-based binary codec
//!
//! Payload data is encoded as an Avro datum against the schema registered
//! under the codec's type name and the payload's declared version. Frame:
//!
//! ```text
//! "FXA1" | u16 name length | type name | u32 meta length | meta | u32 datum length | datum
//! ```
//!
//! `meta` is the compact encoding of the envelope and the payload fields other
//! than `data`. CRC32 and SHA-256 of the final buffer travel beside it in the
//! [`SerializationResult`], not inline.

use apache_avro::types::Value as AvroValue;
use serde_json::{Map, Number, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::compact::{decode_value, encode_value};
use super::compression::CompressionStage;
use super::{finish_encode, into_message, open_frame, require_fields, MessageCodec, SerializationFormat, SerializationResult};
use crate::checksum::{crc32, Checksum};
use crate::compiler::{NamedType, Primitive, TypeRef, TypeTable};
use crate::config::CodecConfig;
use crate::envelope::Message;
use crate::error::{ExchangeError, Result};
use crate::registry::SchemaRegistry;
use crate::version::SchemaVersion;

/// Frame magic
pub const AVRO_MAGIC: [u8; 4] = *b"FXA1";

/// Binary codec bound to one registered message type
pub struct AvroCodec {
    registry: Arc<SchemaRegistry>,
    type_name: String,
    config: CodecConfig,
    stage: CompressionStage,
}

impl AvroCodec {
    pub fn new(registry: Arc<SchemaRegistry>, type_name: impl Into<String>, config: CodecConfig) -> Self {
        let stage = CompressionStage::new(config.compression.clone());
        Self {
            registry,
            type_name: type_name.into(),
            config,
            stage,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Verify the CRC32 and content hash reported at encode time, then decode
    pub fn deserialize_verified(&self, bytes: &[u8], expected_crc: u32, expected_hash: &Checksum) -> Result<Message> {
        let actual = crc32(bytes);
        if actual != expected_crc {
            return Err(ExchangeError::CrcMismatch {
                expected: expected_crc,
                actual,
            });
        }
        let hash = Checksum::from_bytes(bytes);
        if &hash != expected_hash {
            return Err(ExchangeError::ChecksumMismatch {
                expected: expected_hash.to_string(),
                actual: hash.to_string(),
            });
        }
        self.deserialize(bytes)
    }
}

impl MessageCodec for AvroCodec {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Avro
    }

    fn serialize(&self, message: &Message) -> Result<SerializationResult> {
        let compiled = self.registry.compiled(&self.type_name, message.schema_version())?;
        compiled.validate(message.data())?;
        let datum = apache_avro::to_avro_datum(
            compiled.avro(),
            to_avro(compiled.types(), compiled.root(), message.data())?,
        )?;

        // the datum is what the consumer will see; keep the checksum in step with it
        let normalized = from_avro(apache_avro::from_avro_datum(compiled.avro(), &mut datum.as_slice(), None)?)?;
        let message = if &normalized == message.data() {
            Cow::Borrowed(message)
        } else {
            debug!(
                message_id = %message.message_id(),
                type_name = %self.type_name,
                "payload data normalized by schema encoding"
            );
            Cow::Owned(message.with_data(normalized))
        };

        let mut wire = serde_json::to_value(message.as_ref())?;
        if let Some(payload) = wire.get_mut("payload").and_then(Value::as_object_mut) {
            payload.remove("data");
        }
        let meta = encode_value(&wire)?;

        let name = self.type_name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| ExchangeError::InvalidFormat(format!("type name too long: {}", self.type_name)))?;
        let mut frame = Vec::with_capacity(AVRO_MAGIC.len() + 10 + name.len() + meta.len() + datum.len());
        frame.extend_from_slice(&AVRO_MAGIC);
        frame.extend_from_slice(&name_len.to_be_bytes());
        frame.extend_from_slice(name);
        write_section(&mut frame, &meta)?;
        write_section(&mut frame, &datum)?;

        let mut result = finish_encode(frame, SerializationFormat::Avro, &self.stage, self.config.max_size)?;
        result.crc32 = Some(crc32(&result.bytes));
        result.content_hash = Some(Checksum::from_bytes(&result.bytes));
        Ok(result)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        let body = open_frame(bytes, &self.stage, self.config.max_size)?;
        let frame = Frame::parse(&body)?;
        if frame.type_name != self.type_name {
            return Err(ExchangeError::InvalidFormat(format!(
                "frame carries type '{}' but the codec is bound to '{}'",
                frame.type_name, self.type_name
            )));
        }

        let mut wire = decode_value(frame.meta)?;
        require_fields(&wire)?;
        let version = wire
            .pointer("/payload/schema_version")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::missing("payload.schema_version"))
            .and_then(SchemaVersion::parse)?;
        let compiled = self.registry.compiled(&self.type_name, &version)?;
        let data = from_avro(apache_avro::from_avro_datum(compiled.avro(), &mut &frame.datum[..], None)?)?;

        wire.get_mut("payload")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ExchangeError::missing("payload"))?
            .insert("data".to_string(), data);
        into_message(wire, &self.config)
    }
}

fn write_section(frame: &mut Vec<u8>, section: &[u8]) -> Result<()> {
    let len = u32::try_from(section.len()).map_err(|_| ExchangeError::SizeLimitExceeded {
        size: section.len(),
        limit: u32::MAX as usize,
    })?;
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(section);
    Ok(())
}

struct Frame<'a> {
    type_name: &'a str,
    meta: &'a [u8],
    datum: &'a [u8],
}

impl<'a> Frame<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self> {
        let rest = bytes
            .strip_prefix(&AVRO_MAGIC[..])
            .ok_or_else(|| ExchangeError::InvalidMessage("not an avro frame".to_string()))?;
        let (name_len, rest) = split_len(rest, 2)?;
        let (name, rest) = split_at(rest, name_len)?;
        let type_name = std::str::from_utf8(name)
            .map_err(|e| ExchangeError::InvalidMessage(format!("type name is not UTF-8: {}", e)))?;
        let (meta_len, rest) = split_len(rest, 4)?;
        let (meta, rest) = split_at(rest, meta_len)?;
        let (datum_len, rest) = split_len(rest, 4)?;
        let (datum, rest) = split_at(rest, datum_len)?;
        if !rest.is_empty() {
            return Err(ExchangeError::InvalidMessage(format!("{} trailing bytes after avro frame", rest.len())));
        }
        Ok(Self { type_name, meta, datum })
    }
}

fn split_at(bytes: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if bytes.len() < n {
        return Err(ExchangeError::InvalidMessage("truncated avro frame".to_string()));
    }
    Ok(bytes.split_at(n))
}

fn split_len(bytes: &[u8], width: usize) -> Result<(usize, &[u8])> {
    let (raw, rest) = split_at(bytes, width)?;
    let len = raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((len, rest))
}

/// Convert validated JSON data into an Avro value shaped by the type table
fn to_avro(types: &TypeTable, type_ref: &TypeRef, value: &Value) -> Result<AvroValue> {
    let unexpected = || ExchangeError::validation("$", format!("cannot encode {} as {}", value, type_ref));
    Ok(match type_ref {
        TypeRef::Primitive(p) => match (p, value) {
            (Primitive::Null, _) => AvroValue::Null,
            (Primitive::Boolean, Value::Bool(b)) => AvroValue::Boolean(*b),
            (Primitive::Int, Value::Number(n)) => {
                AvroValue::Int(n.as_i64().and_then(|i| i32::try_from(i).ok()).ok_or_else(unexpected)?)
            }
            (Primitive::Long, Value::Number(n)) => AvroValue::Long(n.as_i64().ok_or_else(unexpected)?),
            (Primitive::Float, Value::Number(n)) => AvroValue::Float(n.as_f64().ok_or_else(unexpected)? as f32),
            (Primitive::Double, Value::Number(n)) => AvroValue::Double(n.as_f64().ok_or_else(unexpected)?),
            (Primitive::Bytes, Value::String(s)) => AvroValue::Bytes(s.as_bytes().to_vec()),
            (Primitive::String, Value::String(s)) => AvroValue::String(s.clone()),
            _ => return Err(unexpected()),
        },
        TypeRef::Named(name) => match types.get(name) {
            Some(NamedType::Record { fields }) => {
                let obj = value.as_object().ok_or_else(unexpected)?;
                let mut record = Vec::with_capacity(fields.len());
                for field in fields {
                    let item = match obj.get(&field.name) {
                        Some(item) if !item.is_null() => item,
                        _ => field.default.as_ref().unwrap_or(&Value::Null),
                    };
                    record.push((field.name.clone(), to_avro(types, &field.type_ref, item)?));
                }
                AvroValue::Record(record)
            }
            Some(NamedType::Enum { symbols }) => {
                let symbol = value.as_str().ok_or_else(unexpected)?;
                let index = symbols.iter().position(|s| s == symbol).ok_or_else(unexpected)?;
                AvroValue::Enum(index as u32, symbol.to_string())
            }
            Some(NamedType::Fixed { size }) => {
                let bytes = value.as_str().ok_or_else(unexpected)?.as_bytes().to_vec();
                if bytes.len() != *size {
                    return Err(unexpected());
                }
                AvroValue::Fixed(*size, bytes)
            }
            None => return Err(unexpected()),
        },
        TypeRef::Array(items) => AvroValue::Array(
            value
                .as_array()
                .ok_or_else(unexpected)?
                .iter()
                .map(|item| to_avro(types, items, item))
                .collect::<Result<_>>()?,
        ),
        TypeRef::Map(values) => AvroValue::Map(
            value
                .as_object()
                .ok_or_else(unexpected)?
                .iter()
                .map(|(k, item)| Ok((k.clone(), to_avro(types, values, item)?)))
                .collect::<Result<HashMap<_, _>>>()?,
        ),
        TypeRef::Union(branches) => {
            let index = types.select_branch(branches, value).ok_or_else(unexpected)?;
            AvroValue::Union(index as u32, Box::new(to_avro(types, &branches[index], value)?))
        }
    })
}

/// Convert a decoded Avro value back into JSON data
fn from_avro(value: AvroValue) -> Result<Value> {
    Ok(match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(i) => Value::from(i),
        AvroValue::Long(l) => Value::from(l),
        AvroValue::Float(f) => float(f as f64)?,
        AvroValue::Double(d) => float(d)?,
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Union(_, inner) => from_avro(*inner)?,
        AvroValue::Array(items) => Value::Array(items.into_iter().map(from_avro).collect::<Result<_>>()?),
        AvroValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, from_avro(v)?)))
                .collect::<Result<Map<_, _>>>()?,
        ),
        AvroValue::Record(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| Ok((k, from_avro(v)?)))
                .collect::<Result<Map<_, _>>>()?,
        ),
        other => Value::try_from(other)?,
    })
}

fn float(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExchangeError::InvalidMessage(format!("non-finite float {}", f)))
}
