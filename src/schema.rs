//! Schema types and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::compiler::{TypeRef, TypeTable};
use crate::error::Result;
use crate::version::SchemaVersion;

/// Descriptive data of one registered schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub id: Uuid,
    /// Registry name (e.g., "Order")
    pub name: String,
    /// Namespace of the root type, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    pub version: SchemaVersion,
    /// SHA256 of the raw source text
    pub content_hash: Checksum,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Named types referenced but not defined by the source
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SchemaMetadata {
    pub fn new(name: impl Into<String>, version: SchemaVersion, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            package: None,
            version,
            content_hash: Checksum::from_text(content),
            created_at: now,
            updated_at: now,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// A schema version as stored: metadata plus the raw source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistration {
    pub metadata: SchemaMetadata,
    pub content: String,
}

impl SchemaRegistration {
    pub fn new(metadata: SchemaMetadata, content: impl Into<String>) -> Self {
        Self {
            metadata,
            content: content.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &SchemaVersion {
        &self.metadata.version
    }

    /// Verify the stored hash still matches the source
    pub fn verify_hash(&self) -> bool {
        self.metadata.content_hash.verify(&self.content)
    }

    /// Unique key of this registration
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.name, self.metadata.version)
    }
}

/// A registration together with its parsed Avro schema and type table
#[derive(Debug)]
pub struct CompiledSchema {
    registration: Arc<SchemaRegistration>,
    document: Value,
    avro: apache_avro::Schema,
    types: TypeTable,
}

impl CompiledSchema {
    pub(crate) fn new(
        registration: Arc<SchemaRegistration>,
        document: Value,
        avro: apache_avro::Schema,
        types: TypeTable,
    ) -> Self {
        Self {
            registration,
            document,
            avro,
            types,
        }
    }

    pub fn registration(&self) -> &Arc<SchemaRegistration> {
        &self.registration
    }

    pub fn name(&self) -> &str {
        self.registration.name()
    }

    pub fn version(&self) -> &SchemaVersion {
        self.registration.version()
    }

    /// Self-contained schema document, dependencies inlined
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn avro(&self) -> &apache_avro::Schema {
        &self.avro
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn root(&self) -> &TypeRef {
        self.types.root()
    }

    /// Check required fields, enum domains and value kinds of `data`
    pub fn validate(&self, data: &Value) -> Result<()> {
        self.types.validate(self.types.root(), data, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_registration_hash() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let content = r#"{"type": "record", "name": "Order", "fields": []}"#;
        let metadata = SchemaMetadata::new("Order", SchemaVersion::new(1, 0, 0), content, now);
        let registration = SchemaRegistration::new(metadata, content);
        assert!(registration.verify_hash());
        assert_eq!(registration.key(), "Order/1.0.0");

        let tampered = SchemaRegistration {
            content: content.replace("Order", "Invoice"),
            ..registration
        };
        assert!(!tampered.verify_hash());
    }
}
