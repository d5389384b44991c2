//! Schema compiler
//!
//! Registered sources are Avro JSON schemas. Compiling one produces the
//! parsed `apache_avro::Schema` used for binary encoding, and a [`TypeTable`]:
//! the named records and enums of the document with field requiredness and
//! defaults, used for validation and compatibility checks.
//!
//! Logical types are treated as their underlying primitive.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{ExchangeError, Result};
use crate::schema::{CompiledSchema, SchemaRegistration};

/// Avro primitive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
}

impl Primitive {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => Primitive::Null,
            "boolean" => Primitive::Boolean,
            "int" => Primitive::Int,
            "long" => Primitive::Long,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            "bytes" => Primitive::Bytes,
            "string" => Primitive::String,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Primitive::Null => "null",
            Primitive::Boolean => "boolean",
            Primitive::Int => "int",
            Primitive::Long => "long",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::Bytes => "bytes",
            Primitive::String => "string",
        }
    }
}

/// Reference to a type from a field, item, value or union branch
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Primitive(Primitive),
    /// Full name of a record, enum or fixed
    Named(String),
    Array(Box<TypeRef>),
    Map(Box<TypeRef>),
    Union(Vec<TypeRef>),
}

impl TypeRef {
    pub fn is_nullable(&self) -> bool {
        match self {
            TypeRef::Primitive(Primitive::Null) => true,
            TypeRef::Union(branches) => branches.iter().any(TypeRef::is_nullable),
            _ => false,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Primitive(p) => f.write_str(p.as_str()),
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::Array(items) => write!(f, "array<{}>", items),
            TypeRef::Map(values) => write!(f, "map<{}>", values),
            TypeRef::Union(branches) => {
                f.write_str("union[")?;
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", branch)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Field of a record
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub type_ref: TypeRef,
    pub default: Option<Value>,
    /// No default and not nullable
    pub required: bool,
}

/// A named type definition
#[derive(Debug, Clone, PartialEq)]
pub enum NamedType {
    Record { fields: Vec<FieldDef> },
    Enum { symbols: Vec<String> },
    Fixed { size: usize },
}

impl NamedType {
    pub fn kind(&self) -> &'static str {
        match self {
            NamedType::Record { .. } => "record",
            NamedType::Enum { .. } => "enum",
            NamedType::Fixed { .. } => "fixed",
        }
    }
}

/// Every named type of a schema document, keyed by full name
#[derive(Debug, Clone, PartialEq)]
pub struct TypeTable {
    root: TypeRef,
    types: BTreeMap<String, NamedType>,
}

impl TypeTable {
    pub fn root(&self) -> &TypeRef {
        &self.root
    }

    pub fn get(&self, full_name: &str) -> Option<&NamedType> {
        self.types.get(full_name)
    }

    pub fn types(&self) -> impl Iterator<Item = (&String, &NamedType)> {
        self.types.iter()
    }

    /// Full name of the root type when it is named
    pub fn root_name(&self) -> Option<&str> {
        match &self.root {
            TypeRef::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Validate `value` against `type_ref`; `path` is the dotted location used in errors
    pub fn validate(&self, type_ref: &TypeRef, value: &Value, path: &str) -> Result<()> {
        let display = if path.is_empty() { "$" } else { path };
        match type_ref {
            TypeRef::Primitive(p) => check_primitive(*p, value, display),
            TypeRef::Named(name) => match self.types.get(name) {
                Some(NamedType::Record { fields }) => {
                    let obj = value
                        .as_object()
                        .ok_or_else(|| mismatch(display, "record", value))?;
                    for field in fields {
                        let field_path = join_path(path, &field.name);
                        match obj.get(&field.name) {
                            None | Some(Value::Null) if field.required => {
                                return Err(ExchangeError::validation(field_path, "required field is missing"));
                            }
                            None => {}
                            Some(Value::Null) if field.type_ref.is_nullable() || field.default.is_some() => {}
                            Some(item) => self.validate(&field.type_ref, item, &field_path)?,
                        }
                    }
                    Ok(())
                }
                Some(NamedType::Enum { symbols }) => match value.as_str() {
                    Some(symbol) if symbols.iter().any(|s| s == symbol) => Ok(()),
                    _ => Err(ExchangeError::validation(
                        display,
                        format!("{} is not one of [{}]", value, symbols.join(", ")),
                    )),
                },
                Some(NamedType::Fixed { .. }) => match value {
                    Value::String(_) => Ok(()),
                    _ => Err(mismatch(display, name, value)),
                },
                None => Err(ExchangeError::validation(display, format!("unknown type '{}'", name))),
            },
            TypeRef::Array(items) => {
                let array = value.as_array().ok_or_else(|| mismatch(display, "array", value))?;
                for (i, item) in array.iter().enumerate() {
                    self.validate(items, item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            TypeRef::Map(values) => {
                let obj = value.as_object().ok_or_else(|| mismatch(display, "map", value))?;
                for (key, item) in obj {
                    self.validate(values, item, &join_path(path, key))?;
                }
                Ok(())
            }
            TypeRef::Union(branches) => {
                let mut last = None;
                for branch in branches {
                    match self.validate(branch, value, path) {
                        Ok(()) => return Ok(()),
                        Err(e) => last = Some(e),
                    }
                }
                // a single non-null branch gives the most useful error
                let non_null: Vec<&TypeRef> = branches.iter().filter(|b| !b.is_nullable()).collect();
                match (non_null.as_slice(), last) {
                    ([only], _) => self.validate(only, value, path),
                    (_, Some(e)) if branches.len() == 1 => Err(e),
                    _ => Err(ExchangeError::validation(
                        display,
                        format!("{} does not match any branch of {}", value, type_ref),
                    )),
                }
            }
        }
    }

    /// Index of the first union branch `value` validates against
    pub fn select_branch(&self, branches: &[TypeRef], value: &Value) -> Option<usize> {
        branches.iter().position(|b| self.validate(b, value, "").is_ok())
    }
}

fn join_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn mismatch(path: &str, expected: &str, value: &Value) -> ExchangeError {
    ExchangeError::validation(path, format!("expected {}, found {}", expected, kind_of(value)))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_primitive(p: Primitive, value: &Value, path: &str) -> Result<()> {
    let ok = match p {
        Primitive::Null => value.is_null(),
        Primitive::Boolean => value.is_boolean(),
        Primitive::Int => value
            .as_i64()
            .map_or(false, |i| i32::try_from(i).is_ok()),
        Primitive::Long => value.is_i64(),
        Primitive::Float | Primitive::Double => value.is_number(),
        Primitive::Bytes | Primitive::String => value.is_string(),
    };
    if ok {
        Ok(())
    } else {
        Err(mismatch(path, p.as_str(), value))
    }
}

/// Facts about a source document gathered before it is compiled
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub document: Value,
    /// Namespace of the root type
    pub package: Option<String>,
    pub root_name: Option<String>,
    /// Named types referenced but not defined
    pub dependencies: Vec<String>,
}

/// Parse source text and collect package and dependency information
pub fn inspect(content: &str) -> Result<SourceInfo> {
    let document: Value = serde_json::from_str(content)
        .map_err(|e| ExchangeError::InvalidFormat(format!("schema source is not JSON: {}", e)))?;
    let mut walker = Walker::default();
    let root = walker.type_ref(&document, None)?;
    let dependencies = walker.unresolved();
    let root_name = match &root {
        TypeRef::Named(name) => Some(name.clone()),
        _ => None,
    };
    let package = root_name
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(ns, _)| ns.to_string());
    Ok(SourceInfo {
        document,
        package,
        root_name,
        dependencies,
    })
}

/// Compile a registration. `resolve` returns the compiled document of a
/// dependency, which is inlined at its first use.
pub fn compile(
    registration: Arc<SchemaRegistration>,
    resolve: &dyn Fn(&str) -> Option<Value>,
) -> Result<CompiledSchema> {
    let info = inspect(&registration.content)?;
    let mut document = info.document;
    if !info.dependencies.is_empty() {
        let mut definitions = BTreeMap::new();
        for dependency in &info.dependencies {
            let definition = resolve(dependency).ok_or_else(|| {
                ExchangeError::InvalidFormat(format!(
                    "schema {} references unknown type '{}'",
                    registration.key(),
                    dependency
                ))
            })?;
            definitions.insert(dependency.clone(), definition);
        }
        let mut inlined = HashSet::new();
        inline_definitions(&mut document, &definitions, &mut inlined);
    }

    let mut walker = Walker::default();
    let root = walker.type_ref(&document, None)?;
    let unresolved = walker.unresolved();
    if !unresolved.is_empty() {
        return Err(ExchangeError::InvalidFormat(format!(
            "unresolved types in {}: {}",
            registration.key(),
            unresolved.join(", ")
        )));
    }
    let avro = apache_avro::Schema::parse(&document)?;
    let types = TypeTable {
        root,
        types: walker.defined,
    };
    Ok(CompiledSchema::new(registration, document, avro, types))
}

/// Replace the first reference to each definition with the definition itself
fn inline_definitions(schema: &mut Value, definitions: &BTreeMap<String, Value>, inlined: &mut HashSet<String>) {
    match schema {
        Value::String(name) => {
            let found = definitions
                .iter()
                .find(|(full, _)| full.as_str() == name.as_str() || full.rsplit('.').next() == Some(name.as_str()));
            if let Some((full, definition)) = found {
                if inlined.insert(full.clone()) {
                    *schema = definition.clone();
                }
            }
        }
        Value::Array(branches) => {
            for branch in branches {
                inline_definitions(branch, definitions, inlined);
            }
        }
        Value::Object(obj) => {
            for key in ["type", "items", "values"] {
                if let Some(child) = obj.get_mut(key) {
                    inline_definitions(child, definitions, inlined);
                }
            }
            if let Some(Value::Array(fields)) = obj.get_mut("fields") {
                for field in fields {
                    if let Some(child) = field.get_mut("type") {
                        inline_definitions(child, definitions, inlined);
                    }
                }
            }
        }
        _ => {}
    }
}

#[derive(Default)]
struct Walker {
    defined: BTreeMap<String, NamedType>,
    referenced: BTreeSet<String>,
}

impl Walker {
    fn unresolved(&self) -> Vec<String> {
        self.referenced
            .iter()
            .filter(|name| !self.defined.contains_key(*name))
            .cloned()
            .collect()
    }

    fn full_name(&self, name: &str, namespace: Option<&str>) -> String {
        match namespace {
            _ if name.contains('.') => name.to_string(),
            Some(ns) if !ns.is_empty() => {
                let qualified = format!("{}.{}", ns, name);
                if !self.defined.contains_key(&qualified) && self.defined.contains_key(name) {
                    name.to_string()
                } else {
                    qualified
                }
            }
            _ => name.to_string(),
        }
    }

    fn type_ref(&mut self, schema: &Value, namespace: Option<&str>) -> Result<TypeRef> {
        match schema {
            Value::String(name) => Ok(match Primitive::parse(name) {
                Some(p) => TypeRef::Primitive(p),
                None => {
                    let full = self.full_name(name, namespace);
                    self.referenced.insert(full.clone());
                    TypeRef::Named(full)
                }
            }),
            Value::Array(branches) => branches
                .iter()
                .map(|b| self.type_ref(b, namespace))
                .collect::<Result<Vec<_>>>()
                .map(TypeRef::Union),
            Value::Object(obj) => self.complex(obj, namespace),
            other => Err(ExchangeError::InvalidFormat(format!("not a schema: {}", other))),
        }
    }

    fn complex(&mut self, obj: &Map<String, Value>, namespace: Option<&str>) -> Result<TypeRef> {
        let kind = obj
            .get("type")
            .ok_or_else(|| ExchangeError::InvalidFormat("schema object without 'type'".to_string()))?;
        let kind = match kind {
            Value::String(kind) => kind.as_str(),
            nested => return self.type_ref(nested, namespace),
        };
        match kind {
            "record" | "error" | "enum" | "fixed" => {
                let (full, own_ns) = self.define_name(obj, namespace)?;
                let named = match kind {
                    "enum" => NamedType::Enum {
                        symbols: string_list(obj.get("symbols"), "symbols")?,
                    },
                    "fixed" => NamedType::Fixed {
                        size: obj.get("size").and_then(Value::as_u64).ok_or_else(|| {
                            ExchangeError::InvalidFormat(format!("fixed '{}' without size", full))
                        })? as usize,
                    },
                    _ => {
                        // registered first so fields may refer back to the record
                        self.defined.insert(full.clone(), NamedType::Record { fields: Vec::new() });
                        let fields = self.fields(obj, &full, own_ns.as_deref())?;
                        NamedType::Record { fields }
                    }
                };
                self.defined.insert(full.clone(), named);
                Ok(TypeRef::Named(full))
            }
            "array" => {
                let items = obj
                    .get("items")
                    .ok_or_else(|| ExchangeError::InvalidFormat("array without 'items'".to_string()))?;
                Ok(TypeRef::Array(Box::new(self.type_ref(items, namespace)?)))
            }
            "map" => {
                let values = obj
                    .get("values")
                    .ok_or_else(|| ExchangeError::InvalidFormat("map without 'values'".to_string()))?;
                Ok(TypeRef::Map(Box::new(self.type_ref(values, namespace)?)))
            }
            primitive => Primitive::parse(primitive)
                .map(TypeRef::Primitive)
                .ok_or_else(|| ExchangeError::InvalidFormat(format!("unknown type '{}'", primitive))),
        }
    }

    fn define_name(&self, obj: &Map<String, Value>, namespace: Option<&str>) -> Result<(String, Option<String>)> {
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::InvalidFormat("named type without 'name'".to_string()))?;
        let (full, own_ns) = match name.rsplit_once('.') {
            Some((ns, _)) => (name.to_string(), Some(ns.to_string())),
            None => {
                let ns = obj
                    .get("namespace")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| namespace.map(str::to_string))
                    .filter(|ns| !ns.is_empty());
                match ns {
                    Some(ns) => (format!("{}.{}", ns, name), Some(ns)),
                    None => (name.to_string(), None),
                }
            }
        };
        if self.defined.contains_key(&full) {
            return Err(ExchangeError::InvalidFormat(format!("type '{}' defined twice", full)));
        }
        Ok((full, own_ns))
    }

    fn fields(&mut self, obj: &Map<String, Value>, record: &str, namespace: Option<&str>) -> Result<Vec<FieldDef>> {
        let raw = obj
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::InvalidFormat(format!("record '{}' without 'fields'", record)))?;
        let mut fields = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for field in raw {
            let name = field
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ExchangeError::InvalidFormat(format!("field without name in '{}'", record)))?;
            if !seen.insert(name) {
                return Err(ExchangeError::InvalidFormat(format!(
                    "field '{}' repeated in '{}'",
                    name, record
                )));
            }
            let schema = field.get("type").ok_or_else(|| {
                ExchangeError::InvalidFormat(format!("field '{}.{}' without type", record, name))
            })?;
            let type_ref = self.type_ref(schema, namespace)?;
            let default = field.get("default").cloned();
            let required = default.is_none() && !type_ref.is_nullable();
            fields.push(FieldDef {
                name: name.to_string(),
                type_ref,
                default,
                required,
            });
        }
        Ok(fields)
    }
}

fn string_list(value: Option<&Value>, what: &str) -> Result<Vec<String>> {
    value
        .and_then(Value::as_array)
        .and_then(|items| items.iter().map(|s| s.as_str().map(str::to_string)).collect())
        .ok_or_else(|| ExchangeError::InvalidFormat(format!("'{}' must be a list of strings", what)))
}


#[cfg(test)]
mod tests {
    use super::fixtures::{registration, ORDER_V1};
    use super::*;
    use crate::codec::fixtures::order_data;
    use serde_json::json;

    fn no_deps(_: &str) -> Option<Value> {
        None
    }

    #[test]
    fn test_compiles_type_table() {
        let compiled = compile(registration("Order", "1.0.0", ORDER_V1), &no_deps).unwrap();
        let types = compiled.types();
        assert_eq!(types.root_name(), Some("familiar.orders.Order"));
        match types.get("familiar.orders.Order") {
            Some(NamedType::Record { fields }) => {
                assert_eq!(fields.len(), 6);
                assert!(fields[0].required);
                assert!(!fields[5].required);
            }
            other => panic!("expected record, got {:?}", other),
        }
        assert!(matches!(types.get("familiar.orders.Status"), Some(NamedType::Enum { .. })));
        assert!(types.get("familiar.orders.Line").is_some());
    }

    #[test]
    fn test_validate_accepts_well_formed_data() {
        let compiled = compile(registration("Order", "1.0.0", ORDER_V1), &no_deps).unwrap();
        compiled.validate(&order_data()).unwrap();
    }

    #[test]
    fn test_validate_reports_paths() {
        let compiled = compile(registration("Order", "1.0.0", ORDER_V1), &no_deps).unwrap();

        let mut data = order_data();
        data.as_object_mut().unwrap().remove("customer");
        match compiled.validate(&data) {
            Err(ExchangeError::Validation { path, .. }) => assert_eq!(path, "customer"),
            other => panic!("expected validation error, got {:?}", other),
        }

        let mut data = order_data();
        data["status"] = json!("LOST");
        match compiled.validate(&data) {
            Err(ExchangeError::Validation { path, reason }) => {
                assert_eq!(path, "status");
                assert!(reason.contains("PENDING"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }

        let mut data = order_data();
        data["lines"][1]["qty"] = json!("two");
        match compiled.validate(&data) {
            Err(ExchangeError::Validation { path, .. }) => assert_eq!(path, "lines[1].qty"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_inspect_collects_dependencies() {
        let source = r#"{
            "type": "record", "name": "Shipment", "namespace": "familiar.orders",
            "fields": [
                {"name": "order", "type": "Order"},
                {"name": "carrier", "type": "string"}
            ]
        }"#;
        let info = inspect(source).unwrap();
        assert_eq!(info.package.as_deref(), Some("familiar.orders"));
        assert_eq!(info.dependencies, vec!["familiar.orders.Order".to_string()]);

        assert!(compile(registration("Shipment", "1.0.0", source), &no_deps).is_err());

        let order = compile(registration("Order", "1.0.0", ORDER_V1), &no_deps).unwrap();
        let order_doc = order.document().clone();
        let resolve = move |name: &str| (name == "familiar.orders.Order").then(|| order_doc.clone());
        let shipment = compile(registration("Shipment", "1.0.0", source), &resolve).unwrap();
        assert!(shipment.types().get("familiar.orders.Status").is_some());
    }

    #[test]
    fn test_rejects_malformed_sources() {
        for bad in [
            "not json",
            r#"{"type": "record", "name": "A"}"#,
            r#"{"type": "enum", "name": "E", "symbols": [1]}"#,
            r#"{"type": "record", "name": "A", "fields": [{"name": "x", "type": "int"}, {"name": "x", "type": "int"}]}"#,
            r#"{"type": "wat"}"#,
        ] {
            assert!(inspect(bad).is_err(), "{bad} should be rejected");
        }
    }
}
