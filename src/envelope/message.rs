//! The exchanged unit: envelope + payload

use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::container::Envelope;
use super::header::MessageType;
use super::payload::Payload;
use crate::error::Result;
use crate::version::SchemaVersion;

/// A message as exchanged between services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    envelope: Envelope,
    payload: Payload,
}

impl Message {
    pub fn new(envelope: Envelope, payload: Payload) -> Self {
        Self { envelope, payload }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_parts(self) -> (Envelope, Payload) {
        (self.envelope, self.payload)
    }

    pub fn message_id(&self) -> Uuid {
        self.envelope.header().message_id()
    }

    pub fn message_type(&self) -> MessageType {
        self.envelope.header().message_type()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope.header().timestamp()
    }

    pub fn schema_version(&self) -> &SchemaVersion {
        self.payload.schema_version()
    }

    pub fn data(&self) -> &Value {
        self.payload.data()
    }

    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        self.envelope.is_expired(clock)
    }

    pub fn can_retry(&self) -> bool {
        self.envelope.can_retry()
    }

    pub fn verify_integrity(&self) -> Result<()> {
        self.payload.verify_integrity()
    }

    pub fn is_trusted(&self) -> bool {
        self.payload.is_trusted()
    }

    /// Copy with a different envelope
    pub fn with_envelope(&self, envelope: Envelope) -> Self {
        Self {
            envelope,
            payload: self.payload.clone(),
        }
    }

    /// Copy with a different payload
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            envelope: self.envelope.clone(),
            payload,
        }
    }

    /// Copy with new data; checksum follows the current payload's policy
    pub fn with_data(&self, data: Value) -> Self {
        let payload = if self.payload.checksum().is_some() {
            self.payload.with_data(data)
        } else {
            self.payload.with_data_unchecked(data)
        };
        self.with_payload(payload)
    }

    /// Copy with one retry more
    pub fn increment_retry(&self) -> Self {
        self.with_envelope(self.envelope.increment_retry())
    }

    /// Response to this message carrying `data` at the same schema version
    pub fn create_response(&self, data: Value, clock: &impl Clock) -> Self {
        let payload = if self.payload.checksum().is_some() {
            Payload::new(data, self.schema_version().clone())
        } else {
            Payload::unchecked(data, self.schema_version().clone())
        };
        Self {
            envelope: self.envelope.create_response(clock),
            payload,
        }
    }
}
