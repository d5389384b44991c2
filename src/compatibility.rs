//! Schema compatibility checking
//!
//! Diffs the type tables of two compiled versions of a schema and decides,
//! under a [`CompatibilityLevel`], which changes are breaking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::compiler::{FieldDef, NamedType, Primitive, TypeRef, TypeTable};
use crate::error::{ExchangeError, Result};
use crate::schema::CompiledSchema;

/// Which schema changes a registry accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityLevel {
    /// No checking
    None,
    /// Consumers on the new version can read data written with the old one
    #[default]
    Backward,
    /// Consumers on the old version can read data written with the new one
    Forward,
    /// Both
    Full,
}

impl CompatibilityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CompatibilityLevel::None => "none",
            CompatibilityLevel::Backward => "backward",
            CompatibilityLevel::Forward => "forward",
            CompatibilityLevel::Full => "full",
        }
    }

    fn checks_backward(self) -> bool {
        matches!(self, CompatibilityLevel::Backward | CompatibilityLevel::Full)
    }

    fn checks_forward(self) -> bool {
        matches!(self, CompatibilityLevel::Forward | CompatibilityLevel::Full)
    }
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompatibilityLevel {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompatibilityLevel::None),
            "backward" => Ok(CompatibilityLevel::Backward),
            "forward" => Ok(CompatibilityLevel::Forward),
            "full" => Ok(CompatibilityLevel::Full),
            other => Err(ExchangeError::Config(format!("unknown compatibility level '{}'", other))),
        }
    }
}

/// Result of a compatibility check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub level: CompatibilityLevel,
    /// Whether the schemas are compatible under `level`
    pub is_compatible: bool,
    /// Whether data must be migrated between the two versions
    pub migration_required: bool,
    /// List of changes detected
    pub changes: Vec<SchemaChange>,
    /// Summary of the compatibility check
    pub summary: String,
}

impl CompatibilityResult {
    fn from_changes(level: CompatibilityLevel, changes: Vec<SchemaChange>) -> Self {
        let breaking = changes.iter().filter(|c| c.is_breaking).count();
        let summary = if changes.is_empty() {
            "No changes detected".to_string()
        } else if breaking > 0 {
            format!("{} breaking changes detected", breaking)
        } else {
            format!("{} compatible changes detected", changes.len())
        };
        Self {
            level,
            is_compatible: breaking == 0,
            migration_required: breaking > 0,
            changes,
            summary,
        }
    }

    /// Descriptions of the breaking changes
    pub fn breaking_changes(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| c.is_breaking)
            .map(|c| c.description.clone())
            .collect()
    }
}

/// A detected change between schema versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub change_type: ChangeType,
    /// Path to the changed element (e.g., "familiar.orders.Order.total")
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    /// Whether this change is breaking under the checked level
    pub is_breaking: bool,
    pub description: String,
}

/// Type of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    FieldAdded,
    FieldRemoved,
    TypeChanged,
    /// A field's optionality changed (required <-> optional)
    OptionalityChanged,
    DefaultChanged,
    EnumVariantAdded,
    EnumVariantRemoved,
    NamedTypeAdded,
    NamedTypeRemoved,
}

/// Compatibility checker for schema versions
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatibilityChecker {
    level: CompatibilityLevel,
}

impl CompatibilityChecker {
    pub fn new(level: CompatibilityLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompatibilityLevel {
        self.level
    }

    /// Check compatibility between two compiled versions of the same schema
    pub fn check(&self, old: &CompiledSchema, new: &CompiledSchema) -> Result<CompatibilityResult> {
        if old.name() != new.name() {
            return Err(ExchangeError::InvalidFormat(format!(
                "cannot compare schemas with different names: {} and {}",
                old.name(),
                new.name()
            )));
        }
        Ok(self.check_types(old.types(), new.types()))
    }

    /// Diff two type tables
    pub fn check_types(&self, old: &TypeTable, new: &TypeTable) -> CompatibilityResult {
        if self.level == CompatibilityLevel::None {
            return CompatibilityResult::from_changes(self.level, Vec::new());
        }
        let mut diff = Diff {
            level: self.level,
            changes: Vec::new(),
        };

        for (name, old_type) in old.types() {
            match new.get(name) {
                None => diff.push(
                    ChangeType::NamedTypeRemoved,
                    name.clone(),
                    Some(old_type.kind().to_string()),
                    None,
                    true,
                    true,
                    format!("Type '{}' was removed", name),
                ),
                Some(new_type) => diff.named(name, old_type, new_type),
            }
        }
        for (name, new_type) in new.types() {
            if old.get(name).is_none() {
                diff.push(
                    ChangeType::NamedTypeAdded,
                    name.clone(),
                    None,
                    Some(new_type.kind().to_string()),
                    false,
                    false,
                    format!("Type '{}' was added", name),
                );
            }
        }

        CompatibilityResult::from_changes(self.level, diff.changes)
    }
}

struct Diff {
    level: CompatibilityLevel,
    changes: Vec<SchemaChange>,
}

impl Diff {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        change_type: ChangeType,
        path: String,
        old_value: Option<String>,
        new_value: Option<String>,
        breaks_backward: bool,
        breaks_forward: bool,
        description: String,
    ) {
        let is_breaking =
            (breaks_backward && self.level.checks_backward()) || (breaks_forward && self.level.checks_forward());
        self.changes.push(SchemaChange {
            change_type,
            path,
            old_value,
            new_value,
            is_breaking,
            description,
        });
    }

    fn named(&mut self, name: &str, old: &NamedType, new: &NamedType) {
        match (old, new) {
            (NamedType::Record { fields: old_fields }, NamedType::Record { fields: new_fields }) => {
                self.record(name, old_fields, new_fields)
            }
            (NamedType::Enum { symbols: old_symbols }, NamedType::Enum { symbols: new_symbols }) => {
                for symbol in old_symbols.iter().filter(|s| !new_symbols.contains(s)) {
                    self.push(
                        ChangeType::EnumVariantRemoved,
                        name.to_string(),
                        Some(symbol.clone()),
                        None,
                        true,
                        true,
                        format!("Enum '{}' lost symbol '{}'", name, symbol),
                    );
                }
                for symbol in new_symbols.iter().filter(|s| !old_symbols.contains(s)) {
                    self.push(
                        ChangeType::EnumVariantAdded,
                        name.to_string(),
                        None,
                        Some(symbol.clone()),
                        false,
                        false,
                        format!("Enum '{}' gained symbol '{}'", name, symbol),
                    );
                }
            }
            (NamedType::Fixed { size: old_size }, NamedType::Fixed { size: new_size }) if old_size == new_size => {}
            _ => self.push(
                ChangeType::TypeChanged,
                name.to_string(),
                Some(format!("{:?}", old)),
                Some(format!("{:?}", new)),
                true,
                true,
                format!("Type '{}' changed from {} to {}", name, old.kind(), new.kind()),
            ),
        }
    }

    fn record(&mut self, record: &str, old_fields: &[FieldDef], new_fields: &[FieldDef]) {
        for old in old_fields {
            let path = format!("{}.{}", record, old.name);
            let Some(new) = new_fields.iter().find(|f| f.name == old.name) else {
                self.push(
                    ChangeType::FieldRemoved,
                    path,
                    Some(old.type_ref.to_string()),
                    None,
                    old.required,
                    false,
                    if old.required {
                        format!("Required field '{}' was removed from '{}'", old.name, record)
                    } else {
                        format!("Optional field '{}' was removed from '{}'", old.name, record)
                    },
                );
                continue;
            };

            if old.type_ref != new.type_ref {
                let widened = is_promotion(&old.type_ref, &new.type_ref);
                let narrowed = is_promotion(&new.type_ref, &old.type_ref);
                self.push(
                    ChangeType::TypeChanged,
                    path.clone(),
                    Some(old.type_ref.to_string()),
                    Some(new.type_ref.to_string()),
                    !widened,
                    !narrowed,
                    format!(
                        "Field '{}.{}' type changed from {} to {}",
                        record, old.name, old.type_ref, new.type_ref
                    ),
                );
            }

            if old.required != new.required {
                self.push(
                    ChangeType::OptionalityChanged,
                    path.clone(),
                    Some(requiredness(old).to_string()),
                    Some(requiredness(new).to_string()),
                    new.required,
                    old.required,
                    format!(
                        "Field '{}.{}' became {}",
                        record,
                        old.name,
                        requiredness(new)
                    ),
                );
            } else if old.default != new.default {
                self.push(
                    ChangeType::DefaultChanged,
                    path,
                    old.default.as_ref().map(ToString::to_string),
                    new.default.as_ref().map(ToString::to_string),
                    false,
                    false,
                    format!("Field '{}.{}' default changed", record, old.name),
                );
            }
        }

        for new in new_fields.iter().filter(|f| !old_fields.iter().any(|o| o.name == f.name)) {
            self.push(
                ChangeType::FieldAdded,
                format!("{}.{}", record, new.name),
                None,
                Some(new.type_ref.to_string()),
                false,
                new.required,
                if new.required {
                    format!("Required field '{}' was added to '{}' without a default", new.name, record)
                } else {
                    format!("Field '{}' was added to '{}'", new.name, record)
                },
            );
        }
    }
}

fn requiredness(field: &FieldDef) -> &'static str {
    if field.required {
        "required"
    } else {
        "optional"
    }
}

/// Whether data of type `from` can be read as `to`
fn is_promotion(from: &TypeRef, to: &TypeRef) -> bool {
    use Primitive::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (TypeRef::Primitive(a), TypeRef::Primitive(b)) => matches!(
            (a, b),
            (Int, Long | Float | Double) | (Long, Float | Double) | (Float, Double) | (String, Bytes) | (Bytes, String)
        ),
        (TypeRef::Array(a), TypeRef::Array(b)) | (TypeRef::Map(a), TypeRef::Map(b)) => is_promotion(a, b),
        (TypeRef::Union(a), TypeRef::Union(b)) => a.iter().all(|branch| b.iter().any(|t| is_promotion(branch, t))),
        (single, TypeRef::Union(branches)) => branches.iter().any(|t| is_promotion(single, t)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::compiler::fixtures::{registration, ORDER_V1};

    fn compiled(version: &str, content: &str) -> CompiledSchema {
        compile(registration("Order", version, content), &|_| None).unwrap()
    }

    fn v1() -> CompiledSchema {
        compiled("1.0.0", ORDER_V1)
    }

    #[test]
    fn test_identical_schemas_are_compatible() {
        let result = CompatibilityChecker::new(CompatibilityLevel::Full).check(&v1(), &v1()).unwrap();
        assert!(result.is_compatible);
        assert!(!result.migration_required);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_compatible_field_addition() {
        let v2 = ORDER_V1.replace(
            r#"{"name": "note", "type": ["null", "string"], "default": null}"#,
            r#"{"name": "note", "type": ["null", "string"], "default": null},
            {"name": "channel", "type": "string", "default": "web"}"#,
        );
        let result = CompatibilityChecker::new(CompatibilityLevel::Full)
            .check(&v1(), &compiled("1.1.0", &v2))
            .unwrap();
        assert!(result.is_compatible);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].change_type, ChangeType::FieldAdded);
    }

    #[test]
    fn test_required_addition_breaks_forward_only() {
        let v2 = ORDER_V1.replace(
            r#"{"name": "customer", "type": "string"},"#,
            r#"{"name": "customer", "type": "string"}, {"name": "region", "type": "string"},"#,
        );
        let v2 = compiled("2.0.0", &v2);
        let backward = CompatibilityChecker::new(CompatibilityLevel::Backward).check(&v1(), &v2).unwrap();
        assert!(backward.is_compatible);
        let forward = CompatibilityChecker::new(CompatibilityLevel::Forward).check(&v1(), &v2).unwrap();
        assert!(!forward.is_compatible);
        assert!(forward.breaking_changes()[0].contains("region"));
    }

    #[test]
    fn test_breaking_field_removal() {
        let v2 = ORDER_V1.replace(r#"{"name": "customer", "type": "string"},"#, "");
        let result = CompatibilityChecker::new(CompatibilityLevel::Backward)
            .check(&v1(), &compiled("2.0.0", &v2))
            .unwrap();
        assert!(!result.is_compatible);
        assert!(result.migration_required);
        assert_eq!(result.breaking_changes().len(), 1);
        assert!(result.breaking_changes()[0].contains("customer"));
    }

    #[test]
    fn test_type_promotion_is_backward_compatible() {
        let widened = ORDER_V1.replace(r#"{"name": "qty", "type": "int"}"#, r#"{"name": "qty", "type": "long"}"#);
        let checker = CompatibilityChecker::new(CompatibilityLevel::Backward);
        let result = checker.check(&v1(), &compiled("1.1.0", &widened)).unwrap();
        assert!(result.is_compatible);
        assert_eq!(result.changes[0].change_type, ChangeType::TypeChanged);

        let narrowed = ORDER_V1.replace(r#"{"name": "total", "type": "double"}"#, r#"{"name": "total", "type": "int"}"#);
        let result = checker.check(&v1(), &compiled("2.0.0", &narrowed)).unwrap();
        assert!(!result.is_compatible);
        assert!(result.changes[0].path.ends_with("Order.total"));
    }

    #[test]
    fn test_enum_symbol_removal_breaks_both() {
        let v2 = ORDER_V1.replace(r#"["PENDING", "PAID", "SHIPPED"]"#, r#"["PENDING", "PAID"]"#);
        let v2 = compiled("2.0.0", &v2);
        for level in [CompatibilityLevel::Backward, CompatibilityLevel::Forward] {
            let result = CompatibilityChecker::new(level).check(&v1(), &v2).unwrap();
            assert!(!result.is_compatible, "{level} should reject a removed symbol");
        }
        let none = CompatibilityChecker::new(CompatibilityLevel::None).check(&v1(), &v2).unwrap();
        assert!(none.is_compatible);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("FULL".parse::<CompatibilityLevel>().unwrap(), CompatibilityLevel::Full);
        assert!("sideways".parse::<CompatibilityLevel>().is_err());
        assert_eq!(CompatibilityLevel::default(), CompatibilityLevel::Backward);
    }
}
