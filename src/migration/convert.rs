//! Type coercions for `change_type` and the built-in transform vocabulary

use chrono::{DateTime, Utc};
use serde_json::{Number, Value};

use crate::codec::extended::{format_date, parse_date, ExtendedValue};

use super::path::kind;

/// Result of looking up a coercion target
pub(crate) enum Coercion {
    Converted(Value),
    /// Target type has no converter; the value is left as is
    UnknownTarget,
}

/// Coerce `value` to `target`. Null stays null for every known target.
pub(crate) fn coerce(value: &Value, target: &str) -> Result<Coercion, String> {
    if value.is_null() && is_known(target) {
        return Ok(Coercion::Converted(Value::Null));
    }
    let converted = match target {
        "string" => to_string(value),
        "number" => to_number(value)?,
        "boolean" => to_boolean(value)?,
        "date" => to_date(value)?,
        _ => return Ok(Coercion::UnknownTarget),
    };
    Ok(Coercion::Converted(converted))
}

fn is_known(target: &str) -> bool {
    matches!(target, "string" | "number" | "boolean" | "date")
}

fn to_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        _ => match ExtendedValue::from_tagged(value) {
            Some(ExtendedValue::Date(dt)) => Value::String(format_date(&dt)),
            Some(ExtendedValue::BigInt(digits)) => Value::String(digits),
            _ => Value::String(value.to_string()),
        },
    }
}

fn to_number(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(raw) => parse_number(raw.trim())
            .ok_or_else(|| format!("cannot convert '{raw}' to a number")),
        _ => match ExtendedValue::from_tagged(value) {
            Some(ExtendedValue::Date(dt)) => Ok(Value::from(dt.timestamp_millis())),
            Some(ExtendedValue::BigInt(digits)) => parse_number(&digits)
                .ok_or_else(|| format!("bigint {digits} does not fit a number")),
            _ => Err(format!("cannot convert {} to a number", kind(value))),
        },
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn to_boolean(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(Value::Bool(false)),
            _ => Err(format!("cannot convert '{raw}' to a boolean")),
        },
        _ => Err(format!("cannot convert {} to a boolean", kind(value))),
    }
}

fn to_date(value: &Value) -> Result<Value, String> {
    let date = match value {
        Value::String(raw) => parse_date(raw.trim()),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => match ExtendedValue::from_tagged(value) {
            Some(ExtendedValue::Date(dt)) => Some(dt),
            _ => None,
        },
    };
    date.map(ExtendedValue::date)
        .ok_or_else(|| format!("cannot convert {value} to a date"))
}

/// Outcome of resolving a built-in transform name
pub(crate) enum BuiltIn {
    Applied(Value),
    Unknown,
}

/// `toUpperCase`, `toLowerCase` and `multiply:<factor>`
pub(crate) fn builtin(name: &str, value: &Value) -> Result<BuiltIn, String> {
    match name {
        "toUpperCase" => value
            .as_str()
            .map(|s| BuiltIn::Applied(Value::String(s.to_uppercase())))
            .ok_or_else(|| format!("toUpperCase expects a string, got {}", kind(value))),
        "toLowerCase" => value
            .as_str()
            .map(|s| BuiltIn::Applied(Value::String(s.to_lowercase())))
            .ok_or_else(|| format!("toLowerCase expects a string, got {}", kind(value))),
        _ => match name.strip_prefix("multiply:") {
            Some(factor) => multiply(value, factor.trim()).map(BuiltIn::Applied),
            None => Ok(BuiltIn::Unknown),
        },
    }
}

fn multiply(value: &Value, factor: &str) -> Result<Value, String> {
    let Value::Number(n) = value else {
        return Err(format!("multiply expects a number, got {}", kind(value)));
    };
    if let (Some(lhs), Ok(rhs)) = (n.as_i64(), factor.parse::<i64>()) {
        if let Some(product) = lhs.checked_mul(rhs) {
            return Ok(Value::from(product));
        }
    }
    let rhs: f64 = factor
        .parse()
        .map_err(|_| format!("invalid multiply factor '{factor}'"))?;
    let lhs = n.as_f64().unwrap_or_default();
    Number::from_f64(lhs * rhs)
        .map(Value::Number)
        .ok_or_else(|| format!("{lhs} * {rhs} is not a finite number"))
}
