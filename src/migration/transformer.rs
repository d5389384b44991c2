//! Version transformer: plans a path between schema versions and applies field rules

use cel_interpreter::{Context, Program, Value as CelValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::envelope::Message;
use crate::error::{ExchangeError, Result};
use crate::registry::SchemaRegistry;
use crate::version::SchemaVersion;

use super::convert::{self, BuiltIn, Coercion};
use super::path;
use super::rule::{AppliedRule, FieldMigrationRule, FieldRuleType, MigrationIssue, MigrationResult, MigrationRule};

/// Named field transformer; an `Err` aborts the migration
pub type FieldTransform = Arc<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Named whole-object transform; the returned object is merged over the input
pub type Restructurer =
    Arc<dyn Fn(&Map<String, Value>) -> std::result::Result<Map<String, Value>, String> + Send + Sync>;

/// Named guard for `predicate:<name>` conditions, evaluated against the whole data
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a single field rule did
enum Step {
    Applied,
    /// No-op with a warning
    Skipped(String),
    /// Reference could not be resolved; recorded as an error, data untouched
    Unresolved(String),
}

enum Guard {
    Met,
    Unmet,
    Unresolvable(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleFile {
    One(MigrationRule),
    Many(Vec<MigrationRule>),
}

/// Rewrites payload data from one schema version to another
pub struct VersionTransformer {
    config: MigrationConfig,
    rules: HashMap<(SchemaVersion, SchemaVersion), Vec<MigrationRule>>,
    transformers: HashMap<String, FieldTransform>,
    restructurers: HashMap<String, Restructurer>,
    predicates: HashMap<String, Predicate>,
    target_schema: Option<(Arc<SchemaRegistry>, String)>,
}

impl VersionTransformer {
    pub fn new(config: MigrationConfig) -> Self {
        Self {
            config,
            rules: HashMap::new(),
            transformers: HashMap::new(),
            restructurers: HashMap::new(),
            predicates: HashMap::new(),
            target_schema: None,
        }
    }

    /// Validate migrated data against `schema_name` at the target version when
    /// `validate_result` is set
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>, schema_name: impl Into<String>) -> Self {
        self.target_schema = Some((registry, schema_name.into()));
        self
    }

    /// Add a rule set; rule sets for the same pair apply in the order they were added
    pub fn add_rule(&mut self, rule: MigrationRule) {
        debug!(
            from = %rule.from_version,
            to = %rule.to_version,
            rules = rule.rules.len(),
            "adding migration rule set"
        );
        self.rules
            .entry((rule.from_version.clone(), rule.to_version.clone()))
            .or_default()
            .push(rule);
    }

    /// Load one rule set or an array of rule sets from JSON text
    pub fn load_rules(&mut self, json: &str) -> Result<usize> {
        let sets = match serde_json::from_str::<RuleFile>(json)? {
            RuleFile::One(rule) => vec![rule],
            RuleFile::Many(rules) => rules,
        };
        let count = sets.len();
        for rule in sets {
            self.add_rule(rule);
        }
        Ok(count)
    }

    pub fn register_transformer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.transformers.insert(name.into(), Arc::new(f));
    }

    pub fn register_restructurer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Map<String, Value>) -> std::result::Result<Map<String, Value>, String> + Send + Sync + 'static,
    {
        self.restructurers.insert(name.into(), Arc::new(f));
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(f));
    }

    /// Number of rule sets registered
    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn has_rule(&self, from: &SchemaVersion, to: &SchemaVersion) -> bool {
        self.rules.contains_key(&(from.clone(), to.clone()))
    }

    /// Versions visited going from `from` to `to`, both included.
    ///
    /// Intermediate stops are the rule endpoints lying between the two; the
    /// path descends for a downgrade.
    pub fn plan(&self, from: &SchemaVersion, to: &SchemaVersion) -> Vec<SchemaVersion> {
        if from == to {
            return Vec::new();
        }
        let (low, high) = if from < to { (from, to) } else { (to, from) };
        let mut stops: BTreeSet<SchemaVersion> = self
            .rules
            .keys()
            .flat_map(|(a, b)| [a, b])
            .filter(|v| *v >= low && *v <= high)
            .cloned()
            .collect();
        stops.insert(from.clone());
        stops.insert(to.clone());

        let mut path: Vec<SchemaVersion> = stops.into_iter().collect();
        if from > to {
            path.reverse();
        }
        path
    }

    /// Migrate `message` to `target`. The input message is never modified.
    pub fn migrate(&self, message: &Message, target: &SchemaVersion) -> MigrationResult {
        let from = message.schema_version();
        if from == target {
            return MigrationResult {
                success: true,
                message: Some(message.clone()),
                path: Vec::new(),
                applied_rules: Vec::new(),
                warnings: Vec::new(),
                errors: Vec::new(),
            };
        }

        let path = self.plan(from, target);
        let mut data = message.data().clone();
        let mut result = MigrationResult {
            success: false,
            message: None,
            path: path.clone(),
            applied_rules: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        };

        for pair in path.windows(2) {
            let (step_from, step_to) = (&pair[0], &pair[1]);
            let Some(sets) = self.rules.get(&(step_from.clone(), step_to.clone())) else {
                let issue = MigrationIssue {
                    from: step_from.clone(),
                    to: step_to.clone(),
                    rule_type: None,
                    path: String::new(),
                    message: "no migration rule registered; data passed through unchanged".to_string(),
                };
                warn!(from = %step_from, to = %step_to, "no migration rule, passing data through");
                result.warnings.push(issue);
                continue;
            };

            for rule in sets.iter().flat_map(|set| set.rules.iter()) {
                let issue = |message: String| MigrationIssue {
                    from: step_from.clone(),
                    to: step_to.clone(),
                    rule_type: Some(rule.rule_type),
                    path: rule.path.clone(),
                    message,
                };

                if let Some(condition) = rule.condition.as_deref() {
                    match self.guard(condition, &data) {
                        Guard::Met => {}
                        Guard::Unmet => {
                            debug!(rule = %rule.rule_type, path = %rule.path, condition, "condition unmet, skipping rule");
                            continue;
                        }
                        Guard::Unresolvable(reason) => {
                            warn!(rule = %rule.rule_type, path = %rule.path, condition, "unresolvable condition: {}", reason);
                            result.warnings.push(issue(format!("condition '{condition}' skipped: {reason}")));
                            continue;
                        }
                    }
                }

                match self.apply(rule, &mut data) {
                    Ok(Step::Applied) => result.applied_rules.push(AppliedRule {
                        from: step_from.clone(),
                        to: step_to.clone(),
                        rule_type: rule.rule_type,
                        path: rule.path.clone(),
                    }),
                    Ok(Step::Skipped(reason)) => {
                        warn!(rule = %rule.rule_type, path = %rule.path, "{}", reason);
                        result.warnings.push(issue(reason));
                    }
                    Ok(Step::Unresolved(reason)) => {
                        warn!(rule = %rule.rule_type, path = %rule.path, "{}", reason);
                        result.errors.push(issue(reason));
                    }
                    Err(reason) => {
                        warn!(
                            from = %step_from,
                            to = %step_to,
                            rule = %rule.rule_type,
                            path = %rule.path,
                            "migration aborted: {}",
                            reason
                        );
                        result.errors.push(issue(reason));
                        return result;
                    }
                }
            }
        }

        if !result.errors.is_empty() {
            warn!(from = %from, to = %target, errors = result.errors.len(), "migration failed");
            return result;
        }

        if let Err(e) = self.validate_result(&data, target) {
            result.errors.push(MigrationIssue {
                from: from.clone(),
                to: target.clone(),
                rule_type: None,
                path: String::new(),
                message: e.to_string(),
            });
            warn!(from = %from, to = %target, "migrated data failed validation: {}", e);
            return result;
        }

        let migrated = message.with_data(data);
        let migrated = migrated.with_payload(migrated.payload().with_schema_version(target.clone()));
        info!(
            from = %from,
            to = %target,
            applied = result.applied_rules.len(),
            warnings = result.warnings.len(),
            "migrated message"
        );
        result.success = true;
        result.message = Some(migrated);
        result
    }

    /// Migrate, turning a failed result into an error
    pub fn migrate_to(&self, message: &Message, target: &str) -> Result<Message> {
        let target = SchemaVersion::parse(target)?;
        self.migrate(message, &target).into_message()
    }

    fn validate_result(&self, data: &Value, target: &SchemaVersion) -> Result<()> {
        if !self.config.validate_result {
            return Ok(());
        }
        match &self.target_schema {
            Some((registry, name)) => registry.compiled(name, target)?.validate(data),
            None => Err(ExchangeError::Config(
                "validate_result is set but no registry was attached".to_string(),
            )),
        }
    }

    fn guard(&self, condition: &str, data: &Value) -> Guard {
        let Some((kind, arg)) = condition.split_once(':') else {
            return Guard::Unresolvable("expected '<kind>:<argument>'".to_string());
        };
        let met = match kind.trim() {
            "exists" => path::exists(data, arg.trim()),
            "missing" => !path::exists(data, arg.trim()),
            "equals" => {
                let Some((field, expected)) = arg.split_once('=') else {
                    return Guard::Unresolvable("expected 'equals:<path>=<json>'".to_string());
                };
                let expected = serde_json::from_str(expected.trim())
                    .unwrap_or_else(|_| Value::String(expected.trim().to_string()));
                path::get(data, field.trim()) == Some(&expected)
            }
            "predicate" => match self.predicates.get(arg.trim()) {
                Some(predicate) => predicate(data),
                None => return Guard::Unresolvable(format!("unknown predicate '{}'", arg.trim())),
            },
            "cel" => match evaluate_cel(arg, data) {
                Ok(met) => met,
                Err(reason) => return Guard::Unresolvable(reason),
            },
            other => return Guard::Unresolvable(format!("unknown condition kind '{other}'")),
        };
        if met {
            Guard::Met
        } else {
            Guard::Unmet
        }
    }

    fn apply(&self, rule: &FieldMigrationRule, data: &mut Value) -> std::result::Result<Step, String> {
        match rule.rule_type {
            FieldRuleType::AddField => {
                if path::exists(data, &rule.path) {
                    return Ok(Step::Skipped(format!("field '{}' already present", rule.path)));
                }
                let value = rule.default_value.clone().unwrap_or(Value::Null);
                path::set(data, &rule.path, value)?;
                Ok(Step::Applied)
            }
            FieldRuleType::RemoveField => match path::remove(data, &rule.path) {
                Some(_) => Ok(Step::Applied),
                None => Ok(Step::Skipped(format!("field '{}' not present", rule.path))),
            },
            FieldRuleType::RenameField => {
                let source = rule.from_path.as_deref().unwrap_or(&rule.path);
                let Some(destination) = rule.to_path.as_deref() else {
                    return Ok(Step::Unresolved("rename_field needs a to_path".to_string()));
                };
                let Some(value) = path::get(data, source).cloned() else {
                    return Ok(Step::Skipped(format!("field '{source}' not present")));
                };
                path::remove(data, source);
                path::set(data, destination, value)?;
                Ok(Step::Applied)
            }
            FieldRuleType::ChangeType => {
                let Some(target) = rule.target_type.as_deref() else {
                    return Ok(Step::Unresolved("change_type needs a target_type".to_string()));
                };
                let Some(current) = path::get(data, &rule.path) else {
                    return Ok(Step::Skipped(format!("field '{}' not present", rule.path)));
                };
                match convert::coerce(current, target)? {
                    Coercion::Converted(value) => {
                        path::set(data, &rule.path, value)?;
                        Ok(Step::Applied)
                    }
                    Coercion::UnknownTarget => Ok(Step::Skipped(format!(
                        "no converter for '{target}'; value passed through"
                    ))),
                }
            }
            FieldRuleType::Transform => {
                let Some(name) = rule.transform_function.as_deref() else {
                    return Ok(Step::Unresolved("transform needs a transform_function".to_string()));
                };
                let Some(current) = path::get(data, &rule.path) else {
                    return Ok(Step::Skipped(format!("field '{}' not present", rule.path)));
                };
                let value = match self.transformers.get(name) {
                    Some(transform) => transform(current)?,
                    None => match convert::builtin(name, current)? {
                        BuiltIn::Applied(value) => value,
                        BuiltIn::Unknown => {
                            return Ok(Step::Unresolved(format!("unknown transform function '{name}'")))
                        }
                    },
                };
                path::set(data, &rule.path, value)?;
                Ok(Step::Applied)
            }
            FieldRuleType::Restructure => {
                let Some(name) = rule.transform_function.as_deref() else {
                    return Ok(Step::Unresolved("restructure needs a transform_function".to_string()));
                };
                let Some(restructure) = self.restructurers.get(name) else {
                    return Ok(Step::Unresolved(format!("unknown restructure function '{name}'")));
                };
                let target = match path::get_mut(data, &rule.path) {
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        return Err(format!("'{}' is a {}, not an object", rule.path, path::kind(other)))
                    }
                    None => return Ok(Step::Skipped(format!("object '{}' not present", rule.path))),
                };
                let merged = restructure(&*target)?;
                target.extend(merged);
                Ok(Step::Applied)
            }
        }
    }
}

fn evaluate_cel(expression: &str, data: &Value) -> std::result::Result<bool, String> {
    let program = Program::compile(expression.trim()).map_err(|e| format!("CEL compilation error: {}", e))?;
    let mut context = Context::default();
    context
        .add_variable("data", data.clone())
        .map_err(|e| format!("CEL context error: {}", e))?;
    match program.execute(&context).map_err(|e| format!("CEL execution error: {}", e))? {
        CelValue::Bool(b) => Ok(b),
        other => Err(format!("expression did not evaluate to a boolean, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures::{message_with, order_message};
    use crate::config::RegistryConfig;
    use serde_json::json;

    fn v(raw: &str) -> SchemaVersion {
        SchemaVersion::parse(raw).unwrap()
    }

    fn transformer() -> VersionTransformer {
        VersionTransformer::new(MigrationConfig::default())
    }

    fn message_at(data: Value, version: &str) -> Message {
        let message = message_with(data);
        message.with_payload(message.payload().with_schema_version(v(version)))
    }

    #[test]
    fn test_identity_fast_path() {
        let t = transformer();
        let message = message_at(json!({"a": 1}), "1.0.0");
        let result = t.migrate(&message, &v("1.0.0"));
        assert!(result.success);
        assert!(result.path.is_empty());
        assert_eq!(result.message.unwrap(), message);
    }

    #[test]
    fn test_add_field_then_reapply_warns() {
        let mut t = transformer();
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.1.0"),
            vec![FieldMigrationRule::add_field("b", json!(1))],
        ));

        let message = message_at(json!({"a": 1}), "1.0.0");
        let result = t.migrate(&message, &v("1.1.0"));
        assert!(result.success);
        assert_eq!(result.path, vec![v("1.0.0"), v("1.1.0")]);
        assert_eq!(result.applied_rules.len(), 1);
        let migrated = result.message.unwrap();
        assert_eq!(migrated.data(), &json!({"a": 1, "b": 1}));
        assert_eq!(migrated.schema_version(), &v("1.1.0"));
        migrated.verify_integrity().unwrap();

        // Same rule on data that already has the field
        let again = message_at(migrated.data().clone(), "1.0.0");
        let result = t.migrate(&again, &v("1.1.0"));
        assert!(result.success);
        assert!(result.applied_rules.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].rule_type, Some(FieldRuleType::AddField));
        assert_eq!(result.message.unwrap().data(), &json!({"a": 1, "b": 1}));

        // Input is untouched
        assert_eq!(message.data(), &json!({"a": 1}));
    }

    #[test]
    fn test_path_through_intermediate_versions() {
        let mut t = transformer();
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.2.0"),
            vec![FieldMigrationRule::rename_field("name", "customer.name")],
        ));
        t.add_rule(MigrationRule::new(
            v("1.2.0"),
            v("1.10.0"),
            vec![FieldMigrationRule::transform("customer.name", "toUpperCase")],
        ));

        let message = message_at(json!({"name": "ada"}), "1.0.0");
        let result = t.migrate(&message, &v("1.10.0"));
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.path, vec![v("1.0.0"), v("1.2.0"), v("1.10.0")]);
        assert_eq!(result.message.unwrap().data(), &json!({"customer": {"name": "ADA"}}));
    }

    #[test]
    fn test_missing_rule_passes_through() {
        let t = transformer();
        let message = message_at(json!({"a": 1}), "1.0.0");
        let result = t.migrate(&message, &v("2.0.0"));
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].rule_type, None);
        let migrated = result.message.unwrap();
        assert_eq!(migrated.data(), &json!({"a": 1}));
        assert_eq!(migrated.schema_version(), &v("2.0.0"));
    }

    #[test]
    fn test_downgrade_walks_descending() {
        let mut t = transformer();
        t.add_rule(MigrationRule::new(v("2.0.0"), v("1.5.0"), vec![FieldMigrationRule::remove_field("extra")]));
        t.add_rule(MigrationRule::new(
            v("1.5.0"),
            v("1.0.0"),
            vec![FieldMigrationRule::change_type("count", "string")],
        ));
        assert_eq!(t.plan(&v("2.0.0"), &v("1.0.0")), vec![v("2.0.0"), v("1.5.0"), v("1.0.0")]);

        let message = message_at(json!({"count": 3, "extra": true}), "2.0.0");
        let result = t.migrate(&message, &v("1.0.0"));
        assert!(result.success);
        assert_eq!(result.message.unwrap().data(), &json!({"count": "3"}));
    }

    #[test]
    fn test_conditions() {
        let mut t = transformer();
        t.register_predicate("big", |data| data["total"].as_f64().unwrap_or_default() > 100.0);
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.1.0"),
            vec![
                FieldMigrationRule::add_field("tier", json!("gold")).with_condition("predicate:big"),
                FieldMigrationRule::add_field("flag", json!(true)).with_condition("exists:missing_field"),
                FieldMigrationRule::add_field("paid", json!(true)).with_condition("equals:status=\"PAID\""),
                FieldMigrationRule::add_field("express", json!(true)).with_condition("cel:data.total > 10.0"),
                FieldMigrationRule::add_field("never", json!(true)).with_condition("predicate:nope"),
            ],
        ));

        let message = message_at(json!({"total": 250.0, "status": "PAID"}), "1.0.0");
        let result = t.migrate(&message, &v("1.1.0"));
        assert!(result.success);
        assert_eq!(
            result.message.unwrap().data(),
            &json!({"total": 250.0, "status": "PAID", "tier": "gold", "paid": true, "express": true})
        );
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("unknown predicate"));
    }

    #[test]
    fn test_custom_transform_and_restructure() {
        let mut t = transformer();
        t.register_transformer("cents", |value| {
            value
                .as_f64()
                .map(|f| json!((f * 100.0).round() as i64))
                .ok_or_else(|| "not a number".to_string())
        });
        t.register_restructurer("split_name", |obj| {
            let full = obj.get("name").and_then(Value::as_str).unwrap_or_default();
            let (first, last) = full.split_once(' ').unwrap_or((full, ""));
            let mut out = Map::new();
            out.insert("first".to_string(), json!(first));
            out.insert("last".to_string(), json!(last));
            Ok(out)
        });
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("2.0.0"),
            vec![
                FieldMigrationRule::transform("total", "cents"),
                FieldMigrationRule::restructure("customer", "split_name"),
                FieldMigrationRule::remove_field("customer.name"),
            ],
        ));

        let message = message_at(json!({"total": 12.5, "customer": {"name": "Ada Lovelace"}}), "1.0.0");
        let result = t.migrate(&message, &v("2.0.0"));
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(
            result.message.unwrap().data(),
            &json!({"total": 1250, "customer": {"first": "Ada", "last": "Lovelace"}})
        );
    }

    #[test]
    fn test_unknown_transform_fails_at_end() {
        let mut t = transformer();
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.1.0"),
            vec![
                FieldMigrationRule::transform("a", "reverse"),
                FieldMigrationRule::add_field("b", json!(2)),
            ],
        ));
        let message = message_at(json!({"a": "x"}), "1.0.0");
        let result = t.migrate(&message, &v("1.1.0"));
        assert!(!result.success);
        assert!(result.message.is_none());
        assert_eq!(result.errors.len(), 1);
        // Later rules still ran
        assert_eq!(result.applied_rules.len(), 1);
    }

    #[test]
    fn test_thrown_error_aborts() {
        let mut t = transformer();
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.1.0"),
            vec![
                FieldMigrationRule::add_field("b", json!(2)),
                FieldMigrationRule::change_type("a", "number"),
                FieldMigrationRule::add_field("c", json!(3)),
            ],
        ));
        let message = message_at(json!({"a": "not a number"}), "1.0.0");
        let result = t.migrate(&message, &v("1.1.0"));
        assert!(!result.success);
        assert_eq!(result.applied_rules.len(), 1);
        assert_eq!(result.errors[0].rule_type, Some(FieldRuleType::ChangeType));
        assert_eq!(message.data(), &json!({"a": "not a number"}));

        let err = t.migrate_to(&message, "1.1.0").unwrap_err();
        assert!(matches!(err, ExchangeError::Migration { .. }));
    }

    #[test]
    fn test_load_rules_from_json() {
        let mut t = transformer();
        let loaded = t
            .load_rules(
                r#"[
                    {"from_version": "1.0.0", "to_version": "1.1.0",
                     "rules": [{"type": "add_field", "path": "b", "default_value": 1}]},
                    {"from_version": "1.1.0", "to_version": "1.2.0",
                     "rules": [{"type": "transform", "path": "b", "transform_function": "multiply:10"}]}
                ]"#,
            )
            .unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(t.rule_count(), 2);
        assert!(t.has_rule(&v("1.1.0"), &v("1.2.0")));

        let result = t.migrate(&message_at(json!({}), "1.0.0"), &v("1.2.0"));
        assert_eq!(result.message.unwrap().data(), &json!({"b": 10}));
    }

    #[tokio::test]
    async fn test_result_validation_against_registry() {
        use crate::compiler::fixtures::ORDER_V1;

        let registry = Arc::new(SchemaRegistry::in_memory(RegistryConfig::default()));
        registry.register("Order", ORDER_V1, "1.0.0").await.unwrap();
        registry.register("Order", ORDER_V1, "1.1.0").await.unwrap();

        let mut t = VersionTransformer::new(MigrationConfig { validate_result: true })
            .with_registry(registry, "Order");
        t.add_rule(MigrationRule::new(
            v("1.0.0"),
            v("1.1.0"),
            vec![FieldMigrationRule::remove_field("customer")],
        ));

        let message = order_message();
        let result = t.migrate(&message, &v("1.1.0"));
        assert!(!result.success);
        assert!(result.errors[0].message.contains("customer"));
    }
}
