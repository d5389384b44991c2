//! Checksummed, versioned payload

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::{canonical_json, Checksum};
use crate::codec::compression::CompressionAlgorithm;
use crate::error::{ExchangeError, Result};
use crate::version::SchemaVersion;

/// Default payload encoding tag
pub const DEFAULT_ENCODING: &str = "json";

/// Opaque application data plus integrity and versioning metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    data: Value,
    schema_version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<Checksum>,
    #[serde(default)]
    size_bytes: usize,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default)]
    compression: CompressionAlgorithm,
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

impl Payload {
    /// Payload with checksum and size computed over the canonical form of `data`
    pub fn new(data: Value, schema_version: SchemaVersion) -> Self {
        let canonical = canonical_json(&data);
        Self {
            checksum: Some(Checksum::from_text(&canonical)),
            size_bytes: canonical.len(),
            data,
            schema_version,
            encoding: default_encoding(),
            compression: CompressionAlgorithm::None,
        }
    }

    /// Payload without a checksum; size is still computed
    pub fn unchecked(data: Value, schema_version: SchemaVersion) -> Self {
        Self {
            size_bytes: canonical_json(&data).len(),
            checksum: None,
            data,
            schema_version,
            encoding: default_encoding(),
            compression: CompressionAlgorithm::None,
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    /// Copy with new data; checksum and size are recomputed
    pub fn with_data(&self, data: Value) -> Self {
        Self {
            encoding: self.encoding.clone(),
            compression: self.compression,
            ..Self::new(data, self.schema_version.clone())
        }
    }

    /// Copy with new data and no checksum
    pub fn with_data_unchecked(&self, data: Value) -> Self {
        Self {
            encoding: self.encoding.clone(),
            compression: self.compression,
            ..Self::unchecked(data, self.schema_version.clone())
        }
    }

    /// Copy declaring a different schema version
    pub fn with_schema_version(&self, schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            ..self.clone()
        }
    }

    /// Copy tagged with the compression applied on the wire
    pub fn with_compression(&self, compression: CompressionAlgorithm) -> Self {
        Self {
            compression,
            ..self.clone()
        }
    }

    /// Copy with a different encoding tag
    pub fn with_encoding(&self, encoding: impl Into<String>) -> Self {
        Self {
            encoding: encoding.into(),
            ..self.clone()
        }
    }

    /// Recompute the checksum over the canonical data.
    ///
    /// A payload without checksum is trivially valid.
    pub fn verify_integrity(&self) -> Result<()> {
        match &self.checksum {
            Some(expected) => {
                let actual = Checksum::from_json(&self.data);
                if &actual == expected {
                    Ok(())
                } else {
                    Err(ExchangeError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    })
                }
            }
            None => Ok(()),
        }
    }

    /// Boolean form of [`Payload::verify_integrity`]
    pub fn is_trusted(&self) -> bool {
        self.verify_integrity().is_ok()
    }
}
