//! Version migration
//!
//! A [`VersionTransformer`] holds [`MigrationRule`] sets keyed by their
//! `(from, to)` versions. Migrating a message plans a path over the rule
//! endpoints between the two versions and applies each step's field rules to
//! a copy of the payload data.

mod convert;
pub mod path;
pub mod rule;
pub mod transformer;

pub use rule::{AppliedRule, FieldMigrationRule, FieldRuleType, MigrationIssue, MigrationResult, MigrationRule};
pub use transformer::{FieldTransform, Predicate, Restructurer, VersionTransformer};
