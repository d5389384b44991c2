//! Envelope / payload model
//!
//! Headers, metadata and payloads are immutable once built. "Updating" any of
//! them returns a new instance, so callers keep history simply by holding on to
//! earlier values.

mod container;
mod draft;
mod header;
mod message;
mod metadata;
mod payload;

pub use container::Envelope;
pub use draft::MessageDraft;
pub use header::{MessageHeader, MessageType, DEFAULT_CONTENT_TYPE, DEFAULT_PROTOCOL_VERSION};
pub use message::Message;
pub use metadata::{MessageMetadata, MessagePriority, DEFAULT_MAX_RETRIES};
pub use payload::{Payload, DEFAULT_ENCODING};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::ErrorKind;
    use chrono::{Duration, TimeZone, Utc};
    use mockable::Clock;
    use serde_json::json;

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn order_message(clock: &FixedClock) -> Message {
        MessageDraft {
            destination: Some("billing".to_string()),
            trace_id: Some("trace-1".to_string()),
            message_type: Some(MessageType::Request),
            ..MessageDraft::new("orders", "1.0.0", json!({"order_id": 7, "total": 12.5}))
        }
        .build(clock)
        .unwrap()
    }

    #[test]
    fn test_build_defaults() {
        let clock = clock();
        let message = order_message(&clock);
        let header = message.envelope().header();
        assert_eq!(header.timestamp(), clock.utc());
        assert_eq!(header.content_type(), DEFAULT_CONTENT_TYPE);
        assert_eq!(message.envelope().metadata().max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(message.payload().encoding(), DEFAULT_ENCODING);
        assert!(message.payload().checksum().is_some());
        assert!(message.payload().size_bytes() > 0);
    }

    #[test]
    fn test_build_generates_unique_ids() {
        let clock = clock();
        let a = order_message(&clock);
        let b = order_message(&clock);
        assert_ne!(a.message_id(), b.message_id());
    }

    #[test]
    fn test_build_rejects_missing_source_and_bad_version() {
        let clock = clock();
        let err = MessageDraft {
            schema_version: Some("1.0.0".to_string()),
            ..MessageDraft::default()
        }
        .build(&clock)
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);

        let err = MessageDraft::new("orders", "1.0", json!({})).build(&clock).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn test_expiry() {
        let clock = clock();
        let message = MessageDraft {
            ttl_ms: Some(1000),
            timestamp: Some(clock.utc() - Duration::milliseconds(2000)),
            ..MessageDraft::new("orders", "1.0.0", json!({}))
        }
        .build(&clock)
        .unwrap();
        assert!(message.is_expired(&clock));

        let fresh = order_message(&clock);
        clock.advance(Duration::days(365));
        assert!(!fresh.is_expired(&clock), "no ttl never expires");
    }

    #[test]
    fn test_retry_gating() {
        let clock = clock();
        let mut message = order_message(&clock);
        let mut previous = message.envelope().metadata().retry_count;
        for _ in 0..DEFAULT_MAX_RETRIES {
            assert!(message.can_retry());
            message = message.increment_retry();
            let current = message.envelope().metadata().retry_count;
            assert!(current > previous);
            previous = current;
        }
        assert!(!message.can_retry());
    }

    #[test]
    fn test_mutators_return_new_instances() {
        let clock = clock();
        let original = order_message(&clock);
        let tagged = original.envelope().with_tag("urgent").with_priority(MessagePriority::High);
        assert!(original.envelope().metadata().tags.is_empty());
        assert_eq!(original.envelope().metadata().priority, MessagePriority::Normal);
        assert_eq!(tagged.metadata().tags, vec!["urgent".to_string()]);
        assert_eq!(tagged.header(), original.envelope().header());
    }

    #[test]
    fn test_delay_until() {
        let clock = clock();
        let message = order_message(&clock);
        let delayed = message
            .envelope()
            .with_delay_until(Some(clock.utc() + Duration::seconds(30)));
        assert!(!delayed.is_ready_at(clock.utc()));
        assert!(delayed.is_ready_at(clock.utc() + Duration::seconds(30)));
        assert!(message.envelope().is_ready_at(clock.utc()));
    }

    #[test]
    fn test_create_response() {
        let clock = clock();
        let request = order_message(&clock);
        let response = request.create_response(json!({"accepted": true}), &clock);
        let header = response.envelope().header();
        assert_eq!(header.source(), "billing");
        assert_eq!(header.destination(), Some("orders"));
        assert_eq!(header.message_type(), MessageType::Response);
        assert_eq!(header.correlation_id(), Some(request.message_id().to_string().as_str()));
        assert_eq!(response.envelope().metadata().trace_id.as_deref(), Some("trace-1"));
        assert_eq!(response.schema_version(), request.schema_version());
        assert_ne!(response.message_id(), request.message_id());
    }

    #[test]
    fn test_response_without_destination_keeps_a_source() {
        let clock = clock();
        let request = MessageDraft::new("orders", "1.0.0", json!({"order_id": 7}))
            .build(&clock)
            .unwrap();
        assert_eq!(request.envelope().header().destination(), None);

        let response = request.create_response(json!({"accepted": true}), &clock);
        let header = response.envelope().header();
        assert_eq!(header.source(), "orders");
        assert_eq!(header.destination(), Some("orders"));
    }

    #[test]
    fn test_checksum_tracks_data() {
        let clock = clock();
        let message = order_message(&clock);
        assert!(message.is_trusted());

        let changed = message.with_data(json!({"order_id": 8, "total": 12.5}));
        assert!(changed.is_trusted());
        assert_ne!(changed.payload().checksum(), message.payload().checksum());

        let again = message.with_data(json!({"total": 12.5, "order_id": 7}));
        assert_eq!(again.payload().checksum(), message.payload().checksum());
    }

    #[test]
    fn test_tampered_payload_is_untrusted() {
        let clock = clock();
        let message = order_message(&clock);
        let mut wire = serde_json::to_value(&message).unwrap();
        wire["payload"]["data"]["total"] = json!(0);
        let tampered: Message = serde_json::from_value(wire).unwrap();
        let err = tampered.verify_integrity().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_missing_checksum_is_trivially_valid() {
        let clock = clock();
        let message = MessageDraft {
            skip_checksum: true,
            ..MessageDraft::new("orders", "1.0.0", json!({"a": 1}))
        }
        .build(&clock)
        .unwrap();
        assert!(message.payload().checksum().is_none());
        assert!(message.is_trusted());
        assert!(message.with_data(json!({"a": 2})).payload().checksum().is_none());
    }
}
