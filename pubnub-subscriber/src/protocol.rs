//! Subscribe wire protocol: envelope types, presence payloads and decoding.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::Error;

/// Suffix that marks the presence companion of a channel or group.
pub const PRESENCE_SUFFIX: &str = "-pnpres";

// ---------------------------------------------------------------------------
// Wire types (JSON)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscribeEnvelope {
    #[serde(rename = "m")]
    pub messages: Vec<SubscribeMessage>,
    #[serde(rename = "t")]
    pub metadata: EnvelopeMetadata,
}

/// Cursor returned by the server for the next poll.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvelopeMetadata {
    #[serde(rename = "t", deserialize_with = "string_or_number")]
    pub timetoken: String,
    #[serde(rename = "r")]
    pub region: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscribeMessage {
    #[serde(rename = "a")]
    pub shard: String,
    #[serde(rename = "b")]
    pub subscription_match: String,
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "i")]
    pub issuing_client_id: String,
    #[serde(rename = "k")]
    pub subscribe_key: String,
    #[serde(rename = "f")]
    pub flags: i64,
    #[serde(rename = "d")]
    pub payload: Value,
    #[serde(rename = "u")]
    pub user_metadata: Value,
    #[serde(rename = "p")]
    pub publish_metadata: PublishMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublishMetadata {
    #[serde(rename = "t", deserialize_with = "string_or_number")]
    pub timetoken: String,
    #[serde(rename = "r")]
    pub region: i32,
}

/// Timetokens are strings on the wire; accept bare numbers as well.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

// ---------------------------------------------------------------------------
// Presence payload
// ---------------------------------------------------------------------------

/// Structured body of a message on a presence channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePayload {
    pub action: String,
    pub uuid: String,
    pub occupancy: i64,
    pub timestamp: i64,
    pub data: Value,
    pub here_now_refresh: bool,
}

impl PresencePayload {
    /// Returns `None` when the payload is not a JSON object. Individual fields
    /// fall back to their defaults when missing or of the wrong type.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        Some(Self {
            action: map
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            uuid: map
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            occupancy: map.get("occupancy").and_then(integer).unwrap_or(0),
            timestamp: map.get("timestamp").and_then(integer).unwrap_or(0),
            data: map.get("data").cloned().unwrap_or(Value::Null),
            here_now_refresh: map
                .get("here_now_refresh")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Integer view of a JSON number; floating-point values are truncated.
fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|n| i64::try_from(n).ok()))
        .or_else(|| value.as_f64().map(|f| f as i64))
}

// ---------------------------------------------------------------------------
// Presence naming helpers
// ---------------------------------------------------------------------------

pub fn is_presence_name(name: &str) -> bool {
    name.ends_with(PRESENCE_SUFFIX)
}

/// Strip the presence suffix, if present.
pub fn base_name(name: &str) -> &str {
    name.strip_suffix(PRESENCE_SUFFIX).unwrap_or(name)
}

pub fn presence_name(base: &str) -> String {
    format!("{base}{PRESENCE_SUFFIX}")
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a long-poll response body.
///
/// A malformed body does not abort decoding: whatever could be recovered
/// (cursor and well-formed messages) is returned together with the error.
pub fn decode_envelope(body: &str) -> (SubscribeEnvelope, Option<Error>) {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return (SubscribeEnvelope::default(), Some(e.into())),
    };
    match serde_json::from_value::<SubscribeEnvelope>(value.clone()) {
        Ok(envelope) => (envelope, None),
        Err(e) => {
            tracing::warn!("partial subscribe envelope: {e}");
            (recover_envelope(&value), Some(e.into()))
        }
    }
}

fn recover_envelope(value: &Value) -> SubscribeEnvelope {
    let metadata = value
        .get("t")
        .and_then(|t| serde_json::from_value(t.clone()).ok())
        .unwrap_or_default();
    let messages = value
        .get("m")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    SubscribeEnvelope { messages, metadata }
}

pub fn parse_timetoken(value: &str) -> Result<u64, Error> {
    value.parse().map_err(|source| Error::Timetoken {
        value: value.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_full_envelope() {
        let body = json!({
            "t": {"t": "15000000000000000", "r": 4},
            "m": [{
                "a": "2",
                "b": "room.*",
                "c": "room.a",
                "i": "publisher-1",
                "k": "demo",
                "f": 0,
                "d": {"text": "hi"},
                "u": {"meta": true},
                "p": {"t": "14999999999999999", "r": 4}
            }]
        })
        .to_string();
        let (envelope, err) = decode_envelope(&body);
        assert!(err.is_none());
        assert_eq!(envelope.metadata.timetoken, "15000000000000000");
        assert_eq!(envelope.metadata.region, 4);
        assert_eq!(envelope.messages.len(), 1);
        let m = &envelope.messages[0];
        assert_eq!(m.shard, "2");
        assert_eq!(m.subscription_match, "room.*");
        assert_eq!(m.channel, "room.a");
        assert_eq!(m.issuing_client_id, "publisher-1");
        assert_eq!(m.subscribe_key, "demo");
        assert_eq!(m.payload, json!({"text": "hi"}));
        assert_eq!(m.user_metadata, json!({"meta": true}));
        assert_eq!(m.publish_metadata.timetoken, "14999999999999999");
    }

    #[test]
    fn decode_handshake_envelope() {
        let (envelope, err) = decode_envelope(r#"{"t":{"t":"16","r":1},"m":[]}"#);
        assert!(err.is_none());
        assert!(envelope.messages.is_empty());
        assert_eq!(envelope.metadata.timetoken, "16");
    }

    #[test]
    fn numeric_timetoken_accepted() {
        let (envelope, err) = decode_envelope(r#"{"t":{"t":17,"r":0},"m":[]}"#);
        assert!(err.is_none());
        assert_eq!(envelope.metadata.timetoken, "17");
    }

    #[test]
    fn invalid_json_yields_empty_envelope() {
        let (envelope, err) = decode_envelope("<html>");
        assert!(matches!(err, Some(Error::Json(_))));
        assert!(envelope.messages.is_empty());
        assert!(envelope.metadata.timetoken.is_empty());
    }

    #[test]
    fn partial_envelope_keeps_valid_parts() {
        let body = r#"{"t":{"t":"20","r":2},"m":[{"c":"ok"},{"c":5}]}"#;
        let (envelope, err) = decode_envelope(body);
        assert!(err.is_some());
        assert_eq!(envelope.metadata.timetoken, "20");
        assert_eq!(envelope.messages.len(), 1);
        assert_eq!(envelope.messages[0].channel, "ok");
    }

    #[test]
    fn presence_payload_with_float_timestamp() {
        let value = json!({
            "action": "join",
            "uuid": "user-1",
            "occupancy": 3,
            "timestamp": 1_700_000_000.0,
            "data": {"mood": "ok"},
            "here_now_refresh": true
        });
        let p = PresencePayload::from_value(&value).unwrap();
        assert_eq!(p.action, "join");
        assert_eq!(p.uuid, "user-1");
        assert_eq!(p.occupancy, 3);
        assert_eq!(p.timestamp, 1_700_000_000);
        assert_eq!(p.data, json!({"mood": "ok"}));
        assert!(p.here_now_refresh);
    }

    #[test]
    fn presence_payload_with_integer_timestamp_and_missing_fields() {
        let p = PresencePayload::from_value(&json!({"action": "leave", "timestamp": 42}))
            .unwrap();
        assert_eq!(p.timestamp, 42);
        assert_eq!(p.occupancy, 0);
        assert_eq!(p.data, Value::Null);
        assert!(!p.here_now_refresh);
    }

    #[test]
    fn presence_payload_rejects_non_objects() {
        assert!(PresencePayload::from_value(&json!("join")).is_none());
        assert!(PresencePayload::from_value(&json!([1])).is_none());
    }

    #[test]
    fn presence_names() {
        assert!(is_presence_name("room1-pnpres"));
        assert!(!is_presence_name("room1"));
        assert_eq!(base_name("room1-pnpres"), "room1");
        assert_eq!(base_name("room1"), "room1");
        assert_eq!(presence_name("room1"), "room1-pnpres");
    }

    #[test]
    fn timetoken_parsing() {
        assert_eq!(parse_timetoken("15000000000000000").unwrap(), 15_000_000_000_000_000);
        assert!(matches!(parse_timetoken(""), Err(Error::Timetoken { .. })));
        assert!(matches!(parse_timetoken("abc"), Err(Error::Timetoken { .. })));
    }
}
