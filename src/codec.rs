//! Task envelope codec.
//!
//! Envelopes travel as JSON documents. Unknown fields are ignored on decode so
//! newer producers can add fields without breaking older workers.

use crate::envelope::TaskEnvelope;
use crate::error::{AnvilError, AnvilResult};

/// Mapping between in-memory envelopes and wire bytes.
pub trait EnvelopeCodec: Send + Sync {
    /// MIME type set on published messages
    fn content_type(&self) -> &'static str;

    /// Serialize an envelope
    fn encode(&self, envelope: &TaskEnvelope) -> AnvilResult<Vec<u8>>;

    /// Deserialize an envelope; malformed input is [`AnvilError::Decode`]
    fn decode(&self, bytes: &[u8]) -> AnvilResult<TaskEnvelope>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, envelope: &TaskEnvelope) -> AnvilResult<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(AnvilError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> AnvilResult<TaskEnvelope> {
        serde_json::from_slice(bytes).map_err(AnvilError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_PATTERN;
    use chrono::DateTime;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_is_exact() {
        let codec = JsonCodec;
        let payloads = [
            json!({"description": "send-email"}),
            json!({"nested": {"list": [1, 2.5, "x", null, true]}, "unicode": "ñ✓"}),
            json!(null),
            json!([]),
        ];

        for payload in payloads {
            let mut envelope = TaskEnvelope::new(DEFAULT_PATTERN, payload);
            envelope.attempt_count = 4;
            let bytes = codec.encode(&envelope).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let codec = JsonCodec;
        let bytes = br#"{
            "id": "abc",
            "pattern": "task_created",
            "payload": {"description": "x"},
            "attempt_count": 1,
            "enqueued_at": "2025-01-02T03:04:05.123456789Z",
            "priority": "high"
        }"#;

        let envelope = codec.decode(bytes).unwrap();
        assert_eq!(envelope.id, "abc");
        assert_eq!(envelope.attempt_count, 1);
    }

    #[test]
    fn test_malformed_bytes_are_decode_errors() {
        let codec = JsonCodec;

        for bytes in [&b"\xff\xfe"[..], b"{\"id\": 1}", b"", b"[1,2,3]"] {
            let err = codec.decode(bytes).unwrap_err();
            assert!(matches!(err, AnvilError::Decode(_)));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_content_type() {
        assert_eq!(JsonCodec.content_type(), "application/json");
    }

    fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            ".*".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
    }

    fn arbitrary_envelope() -> impl Strategy<Value = TaskEnvelope> {
        (
            "[a-z_]{1,16}",
            json_value(),
            any::<u32>(),
            0i64..4_102_444_800,
            0u32..1_000_000_000,
        )
            .prop_map(|(pattern, payload, attempt_count, secs, nanos)| {
                let mut envelope = TaskEnvelope::new(pattern, payload);
                envelope.attempt_count = attempt_count;
                envelope.enqueued_at = DateTime::from_timestamp(secs, nanos).unwrap();
                envelope
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(envelope in arbitrary_envelope()) {
            let codec = JsonCodec;
            let bytes = codec.encode(&envelope).unwrap();
            prop_assert_eq!(codec.decode(&bytes).unwrap(), envelope);
        }
    }
}
