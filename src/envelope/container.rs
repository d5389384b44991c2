//! Header + metadata wrapper

use chrono::{DateTime, Duration, SubsecRound, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::header::MessageHeader;
use super::metadata::{MessageMetadata, MessagePriority};

/// Envelope around a payload.
///
/// Every mutator returns a new `Envelope`, so an envelope can be shared across
/// threads without locking and earlier versions stay valid for callers holding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    header: MessageHeader,
    #[serde(default)]
    metadata: MessageMetadata,
}

impl Envelope {
    pub fn new(header: MessageHeader, metadata: MessageMetadata) -> Self {
        Self { header, metadata }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Whether the ttl has elapsed at `now`; an envelope without ttl never expires
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.header.timestamp());
                age > Duration::milliseconds(ttl.min(i64::MAX as u64) as i64)
            }
            None => false,
        }
    }

    /// Whether the ttl has elapsed according to `clock`
    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        self.is_expired_at(clock.utc())
    }

    /// Whether the message may be delivered at `now` (no pending `delay_until`)
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.metadata.delay_until.map_or(true, |until| now >= until)
    }

    /// `retry_count < max_retries`
    pub fn can_retry(&self) -> bool {
        self.metadata.can_retry()
    }

    fn map_metadata(&self, f: impl FnOnce(&mut MessageMetadata)) -> Self {
        let mut metadata = self.metadata.clone();
        f(&mut metadata);
        Self {
            header: self.header.clone(),
            metadata,
        }
    }

    /// Copy with replaced metadata
    pub fn with_metadata(&self, metadata: MessageMetadata) -> Self {
        Self {
            header: self.header.clone(),
            metadata,
        }
    }

    /// Copy with replaced header
    pub fn with_header(&self, header: MessageHeader) -> Self {
        Self {
            header,
            metadata: self.metadata.clone(),
        }
    }

    pub fn with_priority(&self, priority: MessagePriority) -> Self {
        self.map_metadata(|m| m.priority = priority)
    }

    pub fn with_ttl(&self, ttl_ms: Option<u64>) -> Self {
        self.map_metadata(|m| m.ttl_ms = ttl_ms)
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.map_metadata(|m| {
            if !m.tags.contains(&tag) {
                m.tags.push(tag);
            }
        })
    }

    pub fn with_custom_property(&self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.map_metadata(|m| {
            m.custom.insert(key, value);
        })
    }

    pub fn with_delay_until(&self, delay_until: Option<DateTime<Utc>>) -> Self {
        self.map_metadata(|m| m.delay_until = delay_until.map(|d| d.trunc_subsecs(3)))
    }

    pub fn with_trace(&self, trace_id: Option<String>, span_id: Option<String>) -> Self {
        self.map_metadata(|m| {
            m.trace_id = trace_id;
            m.span_id = span_id;
        })
    }

    pub fn with_routing(&self, routing_key: Option<String>, partition_key: Option<String>) -> Self {
        self.map_metadata(|m| {
            m.routing_key = routing_key;
            m.partition_key = partition_key;
        })
    }

    /// Copy with `retry_count + 1` (saturating)
    pub fn increment_retry(&self) -> Self {
        self.map_metadata(|m| m.retry_count = m.retry_count.saturating_add(1))
    }

    /// Reply envelope: swapped source/destination, trace id copied,
    /// correlation id set to this envelope's message id.
    pub fn create_response(&self, clock: &impl Clock) -> Self {
        let metadata = MessageMetadata {
            trace_id: self.metadata.trace_id.clone(),
            priority: self.metadata.priority,
            ..MessageMetadata::default()
        };
        Self {
            header: self.header.reply(clock.utc()),
            metadata,
        }
    }
}
