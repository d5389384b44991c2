//! Compact self-describing binary codec
//!
//! Every value starts with a one-byte tag. Multi-byte integers are big-endian.
//!
//! | tag         | value                                     |
//! |-------------|-------------------------------------------|
//! | `0x00-0x7f` | positive fixint                           |
//! | `0x80-0x8f` | map, up to 15 entries                     |
//! | `0x90-0x9f` | array, up to 15 items                     |
//! | `0xa0-0xbf` | string, up to 31 bytes                    |
//! | `0xc0`      | null                                      |
//! | `0xc2/0xc3` | false / true                              |
//! | `0xc7`      | ext: `u8` type, `u32` length, body        |
//! | `0xcb`      | f64                                       |
//! | `0xcf`      | u64                                       |
//! | `0xd3`      | i64                                       |
//! | `0xdb`      | string, `u32` length                      |
//! | `0xdd`      | array, `u32` count                        |
//! | `0xdf`      | map, `u32` count                          |
//! | `0xe0-0xff` | negative fixint                           |
//!
//! Ext types carry the extended values of [`super::extended`]: 1 date (`i64`
//! epoch millis), 2 bigint (decimal text), 3 regex (`source\0flags`), 4 set
//! (encoded array), 5 map (encoded array of `[key, value]` pairs).

use chrono::{TimeZone, Utc};
use serde_json::{Map, Number, Value};

use super::compression::CompressionStage;
use super::extended::{malformed, ExtendedValue};
use super::{
    finish_encode, into_message, open_frame, with_canonical_dates, MessageCodec, SerializationFormat, SerializationResult,
};
use crate::config::CodecConfig;
use crate::envelope::Message;
use crate::error::{ExchangeError, Result};

/// Nesting deeper than this is rejected on both encode and decode
pub const MAX_DEPTH: usize = 128;

const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const EXT: u8 = 0xc7;
const F64: u8 = 0xcb;
const U64: u8 = 0xcf;
const I64: u8 = 0xd3;
const STR32: u8 = 0xdb;
const ARRAY32: u8 = 0xdd;
const MAP32: u8 = 0xdf;

const EXT_DATE: u8 = 1;
const EXT_BIGINT: u8 = 2;
const EXT_REGEX: u8 = 3;
const EXT_SET: u8 = 4;
const EXT_MAP: u8 = 5;

/// Binary codec that needs no schema
#[derive(Debug, Clone)]
pub struct CompactCodec {
    config: CodecConfig,
    stage: CompressionStage,
}

impl CompactCodec {
    pub fn new(config: CodecConfig) -> Self {
        let stage = CompressionStage::new(config.compression.clone());
        Self { config, stage }
    }

    pub fn with_compression_stage(mut self, stage: CompressionStage) -> Self {
        self.stage = stage;
        self
    }
}

impl MessageCodec for CompactCodec {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Compact
    }

    fn serialize(&self, message: &Message) -> Result<SerializationResult> {
        let message = with_canonical_dates(message);
        let wire = serde_json::to_value(message.as_ref())?;
        let body = encode_value(&wire)?;
        finish_encode(body, SerializationFormat::Compact, &self.stage, self.config.max_size)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        let body = open_frame(bytes, &self.stage, self.config.max_size)?;
        let wire = decode_value(&body)?;
        into_message(wire, &self.config)
    }
}

/// Encode a JSON value, writing tagged extended values as ext records
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    Encoder { out: &mut out }.value(value, 0)?;
    Ok(out)
}

/// Decode one value; trailing bytes are an error
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { bytes, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != bytes.len() {
        return Err(ExchangeError::InvalidMessage(format!(
            "{} trailing bytes after compact value",
            bytes.len() - decoder.pos
        )));
    }
    Ok(value)
}

fn too_deep() -> ExchangeError {
    ExchangeError::InvalidMessage(format!("compact value nested deeper than {}", MAX_DEPTH))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ExchangeError::SizeLimitExceeded {
        size: len,
        limit: u32::MAX as usize,
    })
}

struct Encoder<'a> {
    out: &'a mut Vec<u8>,
}

impl Encoder<'_> {
    fn value(&mut self, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        match value {
            Value::Null => self.out.push(NIL),
            Value::Bool(false) => self.out.push(FALSE),
            Value::Bool(true) => self.out.push(TRUE),
            Value::Number(n) => self.number(n),
            Value::String(s) => self.string(s)?,
            Value::Array(items) => {
                self.array_header(items.len())?;
                for item in items {
                    self.value(item, depth + 1)?;
                }
            }
            Value::Object(map) => match ExtendedValue::from_tagged(value) {
                Some(ext) => self.ext(&ext, depth)?,
                None => {
                    self.map_header(map.len())?;
                    for (key, item) in map {
                        self.string(key)?;
                        self.value(item, depth + 1)?;
                    }
                }
            },
        }
        Ok(())
    }

    fn number(&mut self, n: &Number) {
        if let Some(u) = n.as_u64() {
            if u <= 0x7f {
                self.out.push(u as u8);
            } else if let Ok(i) = i64::try_from(u) {
                self.out.push(I64);
                self.out.extend_from_slice(&i.to_be_bytes());
            } else {
                self.out.push(U64);
                self.out.extend_from_slice(&u.to_be_bytes());
            }
        } else if let Some(i) = n.as_i64() {
            if i >= -32 {
                self.out.push(i as i8 as u8);
            } else {
                self.out.push(I64);
                self.out.extend_from_slice(&i.to_be_bytes());
            }
        } else {
            let f = n.as_f64().unwrap_or_default();
            self.out.push(F64);
            self.out.extend_from_slice(&f.to_be_bytes());
        }
    }

    fn string(&mut self, s: &str) -> Result<()> {
        let len = s.len();
        if len <= 31 {
            self.out.push(0xa0 | len as u8);
        } else {
            self.out.push(STR32);
            self.out.extend_from_slice(&len_u32(len)?.to_be_bytes());
        }
        self.out.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn array_header(&mut self, len: usize) -> Result<()> {
        if len <= 15 {
            self.out.push(0x90 | len as u8);
        } else {
            self.out.push(ARRAY32);
            self.out.extend_from_slice(&len_u32(len)?.to_be_bytes());
        }
        Ok(())
    }

    fn map_header(&mut self, len: usize) -> Result<()> {
        if len <= 15 {
            self.out.push(0x80 | len as u8);
        } else {
            self.out.push(MAP32);
            self.out.extend_from_slice(&len_u32(len)?.to_be_bytes());
        }
        Ok(())
    }

    fn ext(&mut self, ext: &ExtendedValue, depth: usize) -> Result<()> {
        let (kind, body) = match ext {
            ExtendedValue::Date(dt) => (EXT_DATE, dt.timestamp_millis().to_be_bytes().to_vec()),
            ExtendedValue::BigInt(digits) => (EXT_BIGINT, digits.as_bytes().to_vec()),
            ExtendedValue::Regex { source, flags } => {
                let mut body = Vec::with_capacity(source.len() + flags.len() + 1);
                body.extend_from_slice(source.as_bytes());
                body.push(0);
                body.extend_from_slice(flags.as_bytes());
                (EXT_REGEX, body)
            }
            ExtendedValue::Set(values) => (EXT_SET, self.nested(&Value::Array(values.clone()), depth)?),
            ExtendedValue::Map(entries) => {
                let pairs = entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
                    .collect();
                (EXT_MAP, self.nested(&Value::Array(pairs), depth)?)
            }
        };
        self.out.push(EXT);
        self.out.push(kind);
        self.out.extend_from_slice(&len_u32(body.len())?.to_be_bytes());
        self.out.extend_from_slice(&body);
        Ok(())
    }

    fn nested(&self, value: &Value, depth: usize) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        Encoder { out: &mut body }.value(value, depth + 1)?;
        Ok(body)
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| ExchangeError::InvalidMessage("truncated compact value".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u32(&mut self) -> Result<usize> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn text(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| malformed("string", e))
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        let tag = self.byte()?;
        match tag {
            0x00..=0x7f => Ok(Value::from(tag)),
            0x80..=0x8f => self.map((tag & 0x0f) as usize, depth),
            0x90..=0x9f => self.items((tag & 0x0f) as usize, depth),
            0xa0..=0xbf => Ok(Value::String(self.text((tag & 0x1f) as usize)?)),
            NIL => Ok(Value::Null),
            FALSE => Ok(Value::Bool(false)),
            TRUE => Ok(Value::Bool(true)),
            EXT => self.ext(depth),
            F64 => {
                let f = f64::from_be_bytes(self.array()?);
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| malformed("float", f))
            }
            U64 => Ok(Value::from(u64::from_be_bytes(self.array()?))),
            I64 => Ok(Value::from(i64::from_be_bytes(self.array()?))),
            STR32 => {
                let len = self.u32()?;
                Ok(Value::String(self.text(len)?))
            }
            ARRAY32 => {
                let len = self.u32()?;
                self.items(len, depth)
            }
            MAP32 => {
                let len = self.u32()?;
                self.map(len, depth)
            }
            0xe0..=0xff => Ok(Value::from(tag as i8)),
            other => Err(ExchangeError::InvalidMessage(format!("unknown compact tag 0x{:02x}", other))),
        }
    }

    fn items(&mut self, len: usize, depth: usize) -> Result<Value> {
        // each item takes at least one byte
        let mut items = Vec::with_capacity(len.min(self.bytes.len() - self.pos));
        for _ in 0..len {
            items.push(self.value(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn map(&mut self, len: usize, depth: usize) -> Result<Value> {
        let mut map = Map::new();
        for _ in 0..len {
            let key = match self.value(depth + 1)? {
                Value::String(key) => key,
                other => return Err(malformed("map key", other)),
            };
            let item = self.value(depth + 1)?;
            map.insert(key, item);
        }
        Ok(Value::Object(map))
    }

    fn ext(&mut self, depth: usize) -> Result<Value> {
        let kind = self.byte()?;
        let len = self.u32()?;
        let body = self.take(len)?;
        let ext = match kind {
            EXT_DATE => {
                let raw: [u8; 8] = body.try_into().map_err(|_| malformed("date", "expected 8 bytes"))?;
                let millis = i64::from_be_bytes(raw);
                let dt = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| malformed("date", millis))?;
                ExtendedValue::Date(dt)
            }
            EXT_BIGINT => {
                let digits = std::str::from_utf8(body).map_err(|e| malformed("bigint", e))?;
                ExtendedValue::BigInt(digits.to_string())
            }
            EXT_REGEX => {
                let text = std::str::from_utf8(body).map_err(|e| malformed("regex", e))?;
                let (source, flags) = text
                    .split_once('\0')
                    .ok_or_else(|| malformed("regex", "missing flags separator"))?;
                ExtendedValue::Regex {
                    source: source.to_string(),
                    flags: flags.to_string(),
                }
            }
            EXT_SET => match nested(body, depth)? {
                Value::Array(values) => ExtendedValue::Set(values),
                other => return Err(malformed("set", other)),
            },
            EXT_MAP => match nested(body, depth)? {
                Value::Array(pairs) => {
                    let entries = pairs
                        .into_iter()
                        .map(|pair| match pair {
                            Value::Array(mut kv) if kv.len() == 2 => {
                                let v = kv.pop().unwrap_or_default();
                                let k = kv.pop().unwrap_or_default();
                                Ok((k, v))
                            }
                            other => Err(malformed("map entry", other)),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    ExtendedValue::Map(entries)
                }
                other => return Err(malformed("map", other)),
            },
            other => return Err(ExchangeError::InvalidMessage(format!("unknown ext type {}", other))),
        };
        Ok(ext.to_tagged())
    }
}

fn nested(body: &[u8], depth: usize) -> Result<Value> {
    let mut decoder = Decoder { bytes: body, pos: 0 };
    let value = decoder.value(depth + 1)?;
    if decoder.pos != body.len() {
        return Err(malformed("ext", "trailing bytes"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures::{message_with, order_message};
    use crate::codec::json::JsonCodec;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn codec() -> CompactCodec {
        CompactCodec::new(CodecConfig::default())
    }

    #[test]
    fn test_roundtrip() {
        let message = order_message();
        let result = codec().serialize(&message).unwrap();
        assert_eq!(result.format, SerializationFormat::Compact);
        assert_eq!(codec().deserialize(&result.bytes).unwrap(), message);
    }

    #[test]
    fn test_smaller_than_text() {
        let message = order_message();
        let compact = codec().serialize(&message).unwrap();
        let text = JsonCodec::new(CodecConfig::default()).serialize(&message).unwrap();
        assert!(compact.bytes.len() < text.bytes.len());
    }

    #[test]
    fn test_scalar_tags() {
        assert_eq!(encode_value(&json!(null)).unwrap(), [NIL]);
        assert_eq!(encode_value(&json!(true)).unwrap(), [TRUE]);
        assert_eq!(encode_value(&json!(5)).unwrap(), [0x05]);
        assert_eq!(encode_value(&json!(-1)).unwrap(), [0xff]);
        assert_eq!(encode_value(&json!("ab")).unwrap(), [0xa2, b'a', b'b']);
        assert_eq!(encode_value(&json!(200)).unwrap()[0], I64);
        assert_eq!(encode_value(&json!(u64::MAX)).unwrap()[0], U64);
        assert_eq!(encode_value(&json!(1.5)).unwrap()[0], F64);
        assert_eq!(encode_value(&json!([1, 2])).unwrap(), [0x92, 0x01, 0x02]);
    }

    #[test]
    fn test_numbers_keep_their_kind() {
        for value in [json!(0), json!(127), json!(128), json!(-32), json!(-33), json!(i64::MIN), json!(u64::MAX), json!(2.25)] {
            assert_eq!(decode_value(&encode_value(&value).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn test_extended_values() {
        let data = json!({
            "created": {"$ext": "date", "value": "2024-02-29T08:15:30.250Z"},
            "big": {"$ext": "bigint", "value": "-123456789012345678901234567890"},
            "pattern": {"$ext": "regex", "source": "^a+$", "flags": "gi"},
            "ids": {"$ext": "set", "values": [1, 2, 3]},
            "index": {"$ext": "map", "entries": [[{"k": 1}, "one"], [2, null]]},
            "plain": {"$ext": "unknown", "value": 1}
        });
        let bytes = encode_value(&data).unwrap();
        assert!(bytes.contains(&EXT));
        assert_eq!(decode_value(&bytes).unwrap(), data);

        let message = message_with(data);
        let encoded = codec().serialize(&message).unwrap();
        assert_eq!(codec().deserialize(&encoded.bytes).unwrap(), message);
    }

    #[test]
    fn test_long_collections() {
        let long = json!({
            "text": "x".repeat(300),
            "items": (0..40).collect::<Vec<i32>>(),
            "wide": (0..20).map(|i| (format!("k{}", i), json!(i))).collect::<Map<String, Value>>()
        });
        assert_eq!(decode_value(&encode_value(&long).unwrap()).unwrap(), long);
    }

    #[test]
    fn test_depth_limit() {
        let mut deep = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            deep = json!([deep]);
        }
        assert!(encode_value(&deep).is_err());

        let mut bytes = vec![0x91; MAX_DEPTH + 2];
        bytes.push(0x01);
        assert!(decode_value(&bytes).is_err());
    }

    #[test]
    fn test_malformed_input() {
        assert!(decode_value(&[0xdb, 0, 0, 0, 9, b'a']).is_err());
        assert!(decode_value(&[0xc1]).is_err());
        assert!(decode_value(&[0x01, 0x02]).is_err());
        assert!(decode_value(&[0x81, 0x01, 0x01]).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let message = order_message();
        let mut wire = serde_json::to_value(&message).unwrap();
        wire["payload"]["data"]["customer"] = json!("eve");
        let bytes = encode_value(&wire).unwrap();
        assert_eq!(codec().deserialize(&bytes).unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_missing_version_is_structural() {
        let message = order_message();
        let mut wire = serde_json::to_value(&message).unwrap();
        wire["payload"].as_object_mut().unwrap().remove("schema_version");
        let bytes = encode_value(&wire).unwrap();
        assert_eq!(codec().deserialize(&bytes).unwrap_err().kind(), ErrorKind::Structural);
    }

    #[test]
    fn test_offset_dates_decode_with_valid_checksum() {
        for text in ["2024-01-01T00:00:00Z", "2024-01-01T02:00:00+02:00"] {
            let message = message_with(json!({"created": {"$ext": "date", "value": text}}));
            let bytes = codec().serialize(&message).unwrap().bytes;
            let decoded = codec().deserialize(&bytes).unwrap();
            assert_eq!(decoded.data()["created"]["value"], json!("2024-01-01T00:00:00.000Z"));
            decoded.verify_integrity().unwrap();
        }
    }
}
