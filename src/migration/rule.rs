//! Migration rule and result types
//!
//! Rule sets are plain serde data so they can live in JSON files:
//!
//! ```json
//! {
//!   "from_version": "1.0.0",
//!   "to_version": "1.1.0",
//!   "description": "split customer name",
//!   "rules": [
//!     {"type": "rename_field", "path": "customer", "from_path": "customer", "to_path": "customer.name"},
//!     {"type": "add_field", "path": "channel", "default_value": "web", "condition": "missing:channel"}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::envelope::Message;
use crate::version::SchemaVersion;

/// Kind of field-level edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRuleType {
    AddField,
    RemoveField,
    RenameField,
    ChangeType,
    Transform,
    Restructure,
}

impl FieldRuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldRuleType::AddField => "add_field",
            FieldRuleType::RemoveField => "remove_field",
            FieldRuleType::RenameField => "rename_field",
            FieldRuleType::ChangeType => "change_type",
            FieldRuleType::Transform => "transform",
            FieldRuleType::Restructure => "restructure",
        }
    }
}

impl fmt::Display for FieldRuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field-level edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMigrationRule {
    #[serde(rename = "type")]
    pub rule_type: FieldRuleType,
    /// Dotted path the rule acts on; empty for the root object
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Target of `change_type`: string, number, boolean or date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Named transformer or built-in (`toUpperCase`, `toLowerCase`, `multiply:<factor>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_function: Option<String>,
    /// Guard; the rule is skipped when it is not met
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl FieldMigrationRule {
    fn new(rule_type: FieldRuleType, path: impl Into<String>) -> Self {
        Self {
            rule_type,
            path: path.into(),
            from_path: None,
            to_path: None,
            default_value: None,
            target_type: None,
            transform_function: None,
            condition: None,
        }
    }

    pub fn add_field(path: impl Into<String>, default_value: Value) -> Self {
        Self {
            default_value: Some(default_value),
            ..Self::new(FieldRuleType::AddField, path)
        }
    }

    pub fn remove_field(path: impl Into<String>) -> Self {
        Self::new(FieldRuleType::RemoveField, path)
    }

    pub fn rename_field(from_path: impl Into<String>, to_path: impl Into<String>) -> Self {
        let from_path = from_path.into();
        Self {
            from_path: Some(from_path.clone()),
            to_path: Some(to_path.into()),
            ..Self::new(FieldRuleType::RenameField, from_path)
        }
    }

    pub fn change_type(path: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            target_type: Some(target_type.into()),
            ..Self::new(FieldRuleType::ChangeType, path)
        }
    }

    pub fn transform(path: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            transform_function: Some(function.into()),
            ..Self::new(FieldRuleType::Transform, path)
        }
    }

    /// Whole-object transform of the object at `path`
    pub fn restructure(path: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            transform_function: Some(function.into()),
            ..Self::new(FieldRuleType::Restructure, path)
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Ordered field rules between two versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRule {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub rules: Vec<FieldMigrationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MigrationRule {
    pub fn new(from_version: SchemaVersion, to_version: SchemaVersion, rules: Vec<FieldMigrationRule>) -> Self {
        Self {
            from_version,
            to_version,
            rules,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A warning or error raised while migrating
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationIssue {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// `None` for issues about the path rather than a rule
    pub rule_type: Option<FieldRuleType>,
    pub path: String,
    pub message: String,
}

impl fmt::Display for MigrationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule_type {
            Some(rule_type) => write!(
                f,
                "{} -> {} {} '{}': {}",
                self.from, self.to, rule_type, self.path, self.message
            ),
            None => write!(f, "{} -> {}: {}", self.from, self.to, self.message),
        }
    }
}

/// A rule that changed the data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedRule {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub rule_type: FieldRuleType,
    pub path: String,
}

/// Outcome of a migration
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub success: bool,
    /// The migrated message; `None` on failure
    pub message: Option<Message>,
    /// Versions walked, starting at the source version; empty when nothing had to be done
    pub path: Vec<SchemaVersion>,
    pub applied_rules: Vec<AppliedRule>,
    pub warnings: Vec<MigrationIssue>,
    pub errors: Vec<MigrationIssue>,
}

impl MigrationResult {
    /// The migrated message, or the first error as an [`ExchangeError::Migration`](crate::error::ExchangeError::Migration)
    pub fn into_message(self) -> crate::error::Result<Message> {
        match (self.success, self.message) {
            (true, Some(message)) => Ok(message),
            _ => {
                let issue = self.errors.into_iter().next();
                Err(crate::error::ExchangeError::Migration {
                    from: issue.as_ref().map(|i| i.from.to_string()).unwrap_or_default(),
                    to: issue.as_ref().map(|i| i.to.to_string()).unwrap_or_default(),
                    rule_type: issue
                        .as_ref()
                        .and_then(|i| i.rule_type)
                        .map(|r| r.to_string())
                        .unwrap_or_default(),
                    path: issue.as_ref().map(|i| i.path.clone()).unwrap_or_default(),
                    reason: issue.map(|i| i.message).unwrap_or_else(|| "migration failed".to_string()),
                })
            }
        }
    }
}
