//! Tagging convention for values JSON cannot express natively
//!
//! Extended values travel inside payload data as objects keyed by `$ext`:
//!
//! ```text
//! {"$ext": "date",   "value": "2024-05-01T12:00:00.000Z"}
//! {"$ext": "bigint", "value": "123456789012345678901234567890"}
//! {"$ext": "regex",  "source": "^a+$", "flags": "i"}
//! {"$ext": "set",    "values": [1, 2, 3]}
//! {"$ext": "map",    "entries": [[{"id": 1}, "one"]]}
//! ```
//!
//! The compact codec writes these as ext records and reads them back into the
//! same tagged form. Dates are kept at millisecond precision.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{json, Map, Value};

use crate::error::ExchangeError;

/// Key marking a tagged extended value
pub const EXT_KEY: &str = "$ext";

/// A value outside the plain JSON data model
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedValue {
    Date(DateTime<Utc>),
    BigInt(String),
    Regex { source: String, flags: String },
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl ExtendedValue {
    /// Tag name written under `$ext`
    pub fn type_name(&self) -> &'static str {
        match self {
            ExtendedValue::Date(_) => "date",
            ExtendedValue::BigInt(_) => "bigint",
            ExtendedValue::Regex { .. } => "regex",
            ExtendedValue::Set(_) => "set",
            ExtendedValue::Map(_) => "map",
        }
    }

    /// Tagged JSON form
    pub fn to_tagged(&self) -> Value {
        match self {
            ExtendedValue::Date(dt) => json!({ EXT_KEY: "date", "value": format_date(dt) }),
            ExtendedValue::BigInt(digits) => json!({ EXT_KEY: "bigint", "value": digits }),
            ExtendedValue::Regex { source, flags } => {
                json!({ EXT_KEY: "regex", "source": source, "flags": flags })
            }
            ExtendedValue::Set(values) => json!({ EXT_KEY: "set", "values": values }),
            ExtendedValue::Map(entries) => {
                let entries: Vec<Value> = entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
                    .collect();
                json!({ EXT_KEY: "map", "entries": entries })
            }
        }
    }

    /// Recognize a tagged object. Anything not matching the convention exactly is `None`.
    pub fn from_tagged(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let tag = obj.get(EXT_KEY)?.as_str()?;
        match (tag, obj.len()) {
            ("date", 2) => {
                let raw = obj.get("value")?.as_str()?;
                parse_date(raw).map(ExtendedValue::Date)
            }
            ("bigint", 2) => {
                let digits = obj.get("value")?.as_str()?;
                is_integer_literal(digits).then(|| ExtendedValue::BigInt(digits.to_string()))
            }
            ("regex", 3) => Some(ExtendedValue::Regex {
                source: obj.get("source")?.as_str()?.to_string(),
                flags: obj.get("flags")?.as_str()?.to_string(),
            }),
            ("set", 2) => Some(ExtendedValue::Set(obj.get("values")?.as_array()?.clone())),
            ("map", 2) => {
                let entries = obj
                    .get("entries")?
                    .as_array()?
                    .iter()
                    .map(|entry| match entry.as_array().map(Vec::as_slice) {
                        Some([k, v]) => Some((k.clone(), v.clone())),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(ExtendedValue::Map(entries))
            }
            _ => None,
        }
    }

    /// Tagged date for `dt`, truncated to milliseconds
    pub fn date(dt: DateTime<Utc>) -> Value {
        ExtendedValue::Date(dt).to_tagged()
    }
}

/// Canonical ISO-8601 text of a date: UTC, millisecond precision, `Z` suffix
pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.trunc_subsecs(3).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339 text into a UTC date truncated to milliseconds
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(3))
}

fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Apply `f` to the `value` slot of every object shaped like a tagged date inside `value`
pub(crate) fn visit_dates(value: &mut Value, f: &mut dyn FnMut(&mut Value)) {
    match value {
        Value::Object(map) => {
            if is_date_tag(map) {
                if let Some(slot) = map.get_mut("value") {
                    f(slot);
                    return;
                }
            }
            for child in map.values_mut() {
                visit_dates(child, f);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_dates(item, f);
            }
        }
        _ => {}
    }
}

/// `value` with every tagged date rewritten to canonical millisecond text, or
/// `None` when it is already canonical. Tags that do not parse are left alone.
pub(crate) fn canonical_dates(value: &Value) -> Option<Value> {
    let mut out = value.clone();
    let mut changed = false;
    visit_dates(&mut out, &mut |slot| {
        let Some(date) = slot.as_str().and_then(parse_date) else {
            return;
        };
        let canonical = format_date(&date);
        if slot.as_str() != Some(canonical.as_str()) {
            *slot = Value::String(canonical);
            changed = true;
        }
    });
    changed.then_some(out)
}

fn is_date_tag(map: &Map<String, Value>) -> bool {
    map.len() == 2 && map.get(EXT_KEY).and_then(Value::as_str) == Some("date") && map.contains_key("value")
}

/// Error for a tagged value that could not be rehydrated
pub(crate) fn malformed(kind: &str, detail: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::InvalidMessage(format!("malformed {} value: {}", kind, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_tag_is_canonical() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::nanoseconds(1_234_567);
        let tagged = ExtendedValue::date(dt);
        assert_eq!(tagged, json!({"$ext": "date", "value": "2024-05-01T12:00:00.001Z"}));
        assert!(matches!(ExtendedValue::from_tagged(&tagged), Some(ExtendedValue::Date(_))));
    }

    #[test]
    fn test_recognizes_only_exact_tags() {
        assert!(ExtendedValue::from_tagged(&json!({"$ext": "date", "value": "yesterday"})).is_none());
        assert!(ExtendedValue::from_tagged(&json!({"$ext": "bigint", "value": "12a"})).is_none());
        assert!(ExtendedValue::from_tagged(&json!({"$ext": "set", "values": [], "extra": 1})).is_none());
        assert!(ExtendedValue::from_tagged(&json!({"kind": "set"})).is_none());

        let map = json!({"$ext": "map", "entries": [[1, "one"], [{"k": 2}, "two"]]});
        match ExtendedValue::from_tagged(&map) {
            Some(ExtendedValue::Map(entries)) => assert_eq!(entries.len(), 2),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_visit_dates_reaches_nested_values() {
        let mut data = json!({
            "created": {"$ext": "date", "value": "2024-01-01T00:00:00.000Z"},
            "history": [{"at": {"$ext": "date", "value": "2024-01-02T00:00:00.000Z"}}]
        });
        let mut seen = 0;
        visit_dates(&mut data, &mut |slot| {
            seen += 1;
            *slot = json!(0);
        });
        assert_eq!(seen, 2);
        assert_eq!(data["history"][0]["at"]["value"], json!(0));
    }

    #[test]
    fn test_canonical_dates() {
        let data = json!({
            "created": {"$ext": "date", "value": "2024-01-01T02:00:00+02:00"},
            "set": {"$ext": "set", "values": [{"$ext": "date", "value": "2024-01-02T00:00:00Z"}]},
            "odd": {"$ext": "date", "value": "tomorrow"}
        });
        let canonical = canonical_dates(&data).unwrap();
        assert_eq!(canonical["created"]["value"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(canonical["set"]["values"][0]["value"], json!("2024-01-02T00:00:00.000Z"));
        assert_eq!(canonical["odd"]["value"], json!("tomorrow"));
        assert_eq!(canonical_dates(&canonical), None);
    }
}
