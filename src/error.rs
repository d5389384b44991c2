//! Error types for the exchange core

use thiserror::Error;

/// Result type for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Broad failure category, used by callers to decide what to do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required field is missing or a message is malformed
    Structural,
    /// Checksum or CRC mismatch
    Integrity,
    /// A size bound was exceeded
    Capacity,
    /// Unknown type, unresolved version, validation or compatibility failure
    Schema,
    /// A migration rule failed
    Migration,
    /// Compression or decompression failed
    Compression,
    /// Backend, filesystem or timeout failure
    Io,
    /// Invalid configuration
    Config,
}

/// Exchange core errors
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("CRC32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Payload carries no checksum but checksums are required")]
    MissingChecksum,

    #[error("Size limit exceeded: {size} bytes (limit {limit})")]
    SizeLimitExceeded { size: usize, limit: usize },

    #[error("Schema not found: {name} version {version}")]
    NotFound { name: String, version: String },

    #[error("Schema already exists: {name} version {version}")]
    AlreadyExists { name: String, version: String },

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid schema format: {0}")]
    InvalidFormat(String),

    #[error("Validation failed at '{path}': {reason}")]
    Validation { path: String, reason: String },

    #[error("Incompatible change in {name} {from} -> {to} ({level}): {}", .breaking.join("; "))]
    IncompatibleChange {
        name: String,
        from: String,
        to: String,
        level: String,
        breaking: Vec<String>,
    },

    #[error("Migration {from} -> {to} failed in {rule_type} at '{path}': {reason}")]
    Migration {
        from: String,
        to: String,
        rule_type: String,
        path: String,
        reason: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),
}

impl ExchangeError {
    /// Shorthand for a missing-field error
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }

    /// Shorthand for a validation error at a dotted path
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField { .. } | Self::InvalidMessage(_) | Self::Json(_) => {
                ErrorKind::Structural
            }
            Self::ChecksumMismatch { .. } | Self::CrcMismatch { .. } | Self::MissingChecksum => {
                ErrorKind::Integrity
            }
            Self::SizeLimitExceeded { .. } => ErrorKind::Capacity,
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidVersion(_)
            | Self::InvalidFormat(_)
            | Self::Validation { .. }
            | Self::IncompatibleChange { .. }
            | Self::Semver(_)
            | Self::Avro(_) => ErrorKind::Schema,
            Self::Migration { .. } => ErrorKind::Migration,
            Self::Compression(_) => ErrorKind::Compression,
            Self::Timeout(_) | Self::Backend(_) | Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}
