//! Familiar Exchange
//!
//! Message envelopes, wire codecs and schema evolution for services on the
//! Familiar platform.
//!
//! ## Features
//!
//! - **Envelopes**: routing, delivery and tracing metadata around a checksummed payload
//! - **Codecs**: JSON text, Avro binary against registered schemas, compact self-describing binary
//! - **Compression**: deflate, gzip or brotli, applied only when it actually shrinks the message
//! - **Schema Registry**: semver-ordered versions, compatibility gates, pluggable backends, compiled-schema cache
//! - **Migration**: rule-driven payload rewrites between schema versions
//!
//! ## Flow
//!
//! ```text
//! producer ── MessageDraft ──> Message ── codec ──> bytes
//!                                                     │
//! consumer <── VersionTransformer <── Message <── codec
//!                     │                               │
//!                     └──────── SchemaRegistry ───────┘
//! ```

pub mod checksum;
pub mod clock;
pub mod codec;
pub mod compatibility;
pub mod compiler;
pub mod config;
pub mod envelope;
pub mod error;
pub mod migration;
pub mod registry;
pub mod schema;
pub mod version;

pub use checksum::Checksum;
pub use codec::{build_codec, MessageCodec, SerializationFormat, SerializationResult};
pub use compatibility::{CompatibilityChecker, CompatibilityLevel, CompatibilityResult};
pub use config::ExchangeConfig;
pub use envelope::{Envelope, Message, MessageDraft, Payload};
pub use error::{ErrorKind, ExchangeError, Result};
pub use migration::{FieldMigrationRule, MigrationResult, MigrationRule, VersionTransformer};
pub use registry::SchemaRegistry;
pub use schema::{CompiledSchema, SchemaMetadata, SchemaRegistration};
pub use version::SchemaVersion;
