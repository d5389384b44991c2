//! Message metadata: tracing correlation, delivery policy and routing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default maximum number of delivery retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Metadata carried next to the header.
///
/// `trace_id` and `span_id` are correlation identifiers only; the exchange core
/// never opens or closes spans for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Time to live in milliseconds; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            trace_id: None,
            span_id: None,
            priority: MessagePriority::default(),
            ttl_ms: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            delay_until: None,
            tags: Vec::new(),
            routing_key: None,
            partition_key: None,
            custom: BTreeMap::new(),
        }
    }
}

impl MessageMetadata {
    /// Whether another delivery attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
