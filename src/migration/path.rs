//! Dotted-path access into payload data
//!
//! `customer.address.city` walks objects; a numeric segment indexes an array
//! (`lines.0.qty`). The empty path is the root value.

use serde_json::{Map, Value};

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(root, child)
}

pub fn get_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    segments(path).try_fold(root, child_mut)
}

pub fn exists(root: &Value, path: &str) -> bool {
    get(root, path).is_some()
}

fn split_last(path: &str) -> Option<(String, &str)> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts.split_last()?;
    Some((parents.join("."), last))
}

/// Set `path` to `value`, creating missing intermediate objects.
///
/// Fails when an existing intermediate is neither an object nor an indexable array.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let Some((parent_path, last)) = split_last(path) else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    let mut walked = String::new();
    for segment in segments(&parent_path) {
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(segment);
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return Err(format!("index '{walked}' is out of range")),
            },
            other => return Err(format!("'{walked}' is a {}, not an object", kind(other))),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(format!("index '{path}' is out of range")),
        },
        other => Err(format!("parent of '{path}' is a {}, not an object", kind(other))),
    }
}

/// Remove and return the value at `path`; array elements are removed in place
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, last) = split_last(path)?;
    match get_mut(root, &parent_path)? {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok().filter(|i| *i < items.len())?;
            Some(items.remove(index))
        }
        _ => None,
    }
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_and_indexed() {
        let data = json!({"customer": {"name": "Ada"}, "lines": [{"qty": 2}]});
        assert_eq!(get(&data, "customer.name"), Some(&json!("Ada")));
        assert_eq!(get(&data, "lines.0.qty"), Some(&json!(2)));
        assert_eq!(get(&data, "lines.3.qty"), None);
        assert_eq!(get(&data, ""), Some(&data));
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut data = json!({"a": 1});
        set(&mut data, "b.c.d", json!(true)).unwrap();
        assert_eq!(data, json!({"a": 1, "b": {"c": {"d": true}}}));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut data = json!({"a": 1});
        let err = set(&mut data, "a.b", json!(2)).unwrap_err();
        assert!(err.contains("number"));
        assert_eq!(data, json!({"a": 1}));
    }

    #[test]
    fn test_remove() {
        let mut data = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});
        assert_eq!(remove(&mut data, "a.b"), Some(json!(1)));
        assert_eq!(remove(&mut data, "list.1"), Some(json!(2)));
        assert_eq!(remove(&mut data, "a.missing"), None);
        assert_eq!(data, json!({"a": {"c": 2}, "list": [1, 3]}));
    }
}
