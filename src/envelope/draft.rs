//! Order-independent message construction

use chrono::{DateTime, SubsecRound, Utc};
use mockable::{Clock, DefaultClock};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::container::Envelope;
use super::header::{MessageHeader, MessageType};
use super::message::Message;
use super::metadata::{MessageMetadata, MessagePriority, DEFAULT_MAX_RETRIES};
use super::payload::Payload;
use crate::error::{ExchangeError, Result};
use crate::version::SchemaVersion;

/// Everything needed to build a [`Message`]. Fill in what you need and call
/// [`MessageDraft::build`]; unset fields fall back to their defaults.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub message_id: Option<Uuid>,
    pub timestamp: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub message_type: Option<MessageType>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub correlation_id: Option<String>,
    pub protocol_version: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub priority: Option<MessagePriority>,
    pub ttl_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub max_retries: Option<u32>,
    pub delay_until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub routing_key: Option<String>,
    pub partition_key: Option<String>,
    pub custom: BTreeMap<String, Value>,
    pub data: Option<Value>,
    pub schema_version: Option<String>,
    /// Leave the payload without checksum
    pub skip_checksum: bool,
}

impl MessageDraft {
    /// Draft for `data` at `schema_version` sent by `source`
    pub fn new(source: impl Into<String>, schema_version: impl Into<String>, data: Value) -> Self {
        Self {
            source: Some(source.into()),
            schema_version: Some(schema_version.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Validate and build using the system clock
    pub fn build_now(self) -> Result<Message> {
        self.build(&DefaultClock)
    }

    /// Validate and build; the timestamp defaults to `clock.utc()`
    pub fn build(self, clock: &impl Clock) -> Result<Message> {
        let source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ExchangeError::missing("envelope.header.source"))?;
        let version = self
            .schema_version
            .ok_or_else(|| ExchangeError::missing("payload.schema_version"))?;
        let schema_version = SchemaVersion::parse(&version)?;

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_count = self.retry_count.unwrap_or(0);
        if retry_count > max_retries {
            return Err(ExchangeError::InvalidMessage(format!(
                "retry_count {} exceeds max_retries {}",
                retry_count, max_retries
            )));
        }
        if self.ttl_ms == Some(0) {
            return Err(ExchangeError::InvalidMessage("ttl must be positive".to_string()));
        }

        let header = MessageHeader::new(
            self.message_id,
            self.timestamp.unwrap_or_else(|| clock.utc()),
            self.message_type.unwrap_or_default(),
            source,
        )
        .with_destination(self.destination)
        .with_correlation_id(self.correlation_id);
        let header = match self.content_type {
            Some(content_type) => header.with_content_type(content_type),
            None => header,
        };
        let header = match self.protocol_version {
            Some(protocol_version) => header.with_protocol_version(protocol_version),
            None => header,
        };

        let metadata = MessageMetadata {
            trace_id: self.trace_id,
            span_id: self.span_id,
            priority: self.priority.unwrap_or_default(),
            ttl_ms: self.ttl_ms,
            retry_count,
            max_retries,
            delay_until: self.delay_until.map(|d| d.trunc_subsecs(3)),
            tags: self.tags,
            routing_key: self.routing_key,
            partition_key: self.partition_key,
            custom: self.custom,
        };

        let data = self.data.unwrap_or(Value::Null);
        let payload = if self.skip_checksum {
            Payload::unchecked(data, schema_version)
        } else {
            Payload::new(data, schema_version)
        };

        Ok(Message::new(Envelope::new(header, metadata), payload))
    }
}
