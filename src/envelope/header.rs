//! Immutable message header

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Default content type of a payload
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Default envelope protocol version
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0";

/// Kind of exchanged message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    #[default]
    Event,
    Command,
    Notification,
    Heartbeat,
}

impl MessageType {
    /// Wire name of this message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Command => "command",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message header. Immutable once constructed; derive new headers instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    message_id: Uuid,
    timestamp: DateTime<Utc>,
    #[serde(default = "default_content_type")]
    content_type: String,
    #[serde(default)]
    message_type: MessageType,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default = "default_protocol_version")]
    protocol_version: String,
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

impl MessageHeader {
    /// Create a header; a fresh v4 id is generated when `message_id` is `None`.
    /// Timestamps are kept at millisecond precision.
    pub fn new(
        message_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
        message_type: MessageType,
        source: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.unwrap_or_else(Uuid::new_v4),
            timestamp: timestamp.trunc_subsecs(3),
            content_type: default_content_type(),
            message_type,
            source: source.into(),
            destination: None,
            correlation_id: None,
            protocol_version: default_protocol_version(),
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Copy with a different content type
    pub fn with_content_type(&self, content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..self.clone()
        }
    }

    /// Copy with a destination service
    pub fn with_destination(&self, destination: Option<String>) -> Self {
        Self {
            destination,
            ..self.clone()
        }
    }

    /// Copy with a correlation id
    pub fn with_correlation_id(&self, correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }

    /// Copy with a protocol version string
    pub fn with_protocol_version(&self, protocol_version: impl Into<String>) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            ..self.clone()
        }
    }

    /// Header of a reply to this one: new id, swapped endpoints, correlated to this id.
    ///
    /// A request without a destination is answered from its own source.
    pub(crate) fn reply(&self, timestamp: DateTime<Utc>) -> Self {
        let source = match &self.destination {
            Some(destination) => destination.clone(),
            None => {
                warn!(
                    message_id = %self.message_id,
                    source = %self.source,
                    "request has no destination, replying from its source"
                );
                self.source.clone()
            }
        };
        Self {
            message_id: Uuid::new_v4(),
            timestamp: timestamp.trunc_subsecs(3),
            content_type: self.content_type.clone(),
            message_type: MessageType::Response,
            source,
            destination: Some(self.source.clone()),
            correlation_id: Some(self.message_id.to_string()),
            protocol_version: self.protocol_version.clone(),
        }
    }
}
