// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire envelope for change events.
//!
//! Every change that crosses the broker is wrapped in an [`Envelope`]. The JSON
//! body uses the historical wire keys so that producers and consumers built at
//! different versions keep talking to each other:
//!
//! ```text
//! {
//!   "signal_type":    "SAVE" | "DELETE" | "SYNC",
//!   "cqrs_id":        "<entity type>",
//!   "instance_data":  { "id": 1, "revision": 3, "updated_at": "...", ... },
//!   "instance_pk":    1 | "abc" | null,
//!   "previous_data":  { ... } | null,
//!   "correlation_id": "..." | null,
//!   "expires":        "2026-01-01T00:00:00Z" | null,
//!   "retries":        0,
//!   "meta":           { ... }        (optional)
//! }
//! ```
//!
//! Missing optional keys decode as `None` / `0`. `target_queue` is routing
//! information handled by the transport and never appears in the body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field inside `instance_data` carrying the monotonic revision.
pub const REVISION_FIELD: &str = "revision";

/// Field inside `instance_data` carrying the last modification time.
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Ordered field map of an entity snapshot.
pub type InstanceData = Map<String, Value>;

/// Protocol faults raised while decoding an envelope.
///
/// These are never retried: the same bytes fail the same way on every
/// redelivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Body is not a JSON object or a field has the wrong type.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// A required key is absent.
    #[error("missing required key '{0}'")]
    MissingField(&'static str),

    /// `signal_type` is not one of SAVE, DELETE, SYNC.
    #[error("unknown signal type '{0}'")]
    UnknownSignal(String),
}

// =============================================================================
// SignalType
// =============================================================================

/// Kind of change carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    /// Create or update.
    Save,
    /// Removal.
    Delete,
    /// Corrective re-publication of current master state.
    Sync,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Save => "SAVE",
            Self::Delete => "DELETE",
            Self::Sync => "SYNC",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAVE" => Ok(Self::Save),
            "DELETE" => Ok(Self::Delete),
            "SYNC" => Ok(Self::Sync),
            other => Err(EnvelopeError::UnknownSignal(other.to_string())),
        }
    }
}

// =============================================================================
// InstanceKey
// =============================================================================

/// Primary key of a replicated entity: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    Int(i64),
    Str(String),
}

impl InstanceKey {
    /// Interpret a JSON value as a key. Floats, bools and containers are not keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for InstanceKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for InstanceKey {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for InstanceKey {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A change event as it travels over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub signal_type: SignalType,

    #[serde(rename = "cqrs_id")]
    pub entity_type: String,

    #[serde(default)]
    pub instance_data: InstanceData,

    #[serde(rename = "instance_pk", default)]
    pub instance_key: Option<InstanceKey>,

    #[serde(default)]
    pub previous_data: Option<InstanceData>,

    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Restricts delivery to one consumer queue. Not serialized.
    #[serde(skip)]
    pub target_queue: Option<String>,

    #[serde(rename = "expires", default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "null_as_zero")]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(0))
}

impl Envelope {
    /// Create an envelope with no key, no expiry and zero retries.
    pub fn new(
        signal_type: SignalType,
        entity_type: impl Into<String>,
        instance_data: InstanceData,
    ) -> Self {
        Self {
            signal_type,
            entity_type: entity_type.into(),
            instance_data,
            instance_key: None,
            previous_data: None,
            correlation_id: None,
            target_queue: None,
            expires_at: None,
            retries: 0,
            meta: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<InstanceKey>) -> Self {
        self.instance_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_target_queue(mut self, queue: impl Into<String>) -> Self {
        self.target_queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Decode a broker payload.
    ///
    /// The signal is checked before the rest of the body so that an unknown
    /// signal is reported as such rather than as a generic decode failure.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| EnvelopeError::Malformed("body is not a JSON object".into()))?;

        match obj.get("signal_type") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField("signal_type")),
            Some(Value::String(s)) => {
                SignalType::from_str(s)?;
            }
            Some(other) => {
                return Err(EnvelopeError::Malformed(format!(
                    "signal_type must be a string, got {}",
                    other
                )))
            }
        }

        if !obj.contains_key("cqrs_id") {
            return Err(EnvelopeError::MissingField("cqrs_id"));
        }

        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Encode to the JSON wire body.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Revision carried in `instance_data`, if present and integral.
    pub fn revision(&self) -> Option<i64> {
        self.instance_data.get(REVISION_FIELD).and_then(Value::as_i64)
    }

    /// `updated_at` carried in `instance_data`, if present and RFC 3339.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.instance_data
            .get(UPDATED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Explicit key, falling back to the primary-key field in `instance_data`.
    pub fn key_or_field(&self, pk_field: &str) -> Option<InstanceKey> {
        self.instance_key
            .clone()
            .or_else(|| self.instance_data.get(pk_field).and_then(InstanceKey::from_value))
    }

    /// Whether the envelope has passed its expiry. `None` never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn data(value: Value) -> InstanceData {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_signal_type_wire_names() {
        assert_eq!(serde_json::to_string(&SignalType::Save).unwrap(), "\"SAVE\"");
        assert_eq!(serde_json::to_string(&SignalType::Delete).unwrap(), "\"DELETE\"");
        assert_eq!(serde_json::to_string(&SignalType::Sync).unwrap(), "\"SYNC\"");
        assert_eq!("SYNC".parse::<SignalType>().unwrap(), SignalType::Sync);
        assert_eq!(SignalType::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_instance_key_from_value() {
        assert_eq!(InstanceKey::from_value(&json!(7)), Some(InstanceKey::Int(7)));
        assert_eq!(InstanceKey::from_value(&json!("a-1")), Some(InstanceKey::from("a-1")));
        assert_eq!(InstanceKey::from_value(&json!(1.5)), None);
        assert_eq!(InstanceKey::from_value(&json!(null)), None);
    }

    #[test]
    fn test_instance_key_display() {
        assert_eq!(InstanceKey::Int(42).to_string(), "42");
        assert_eq!(InstanceKey::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_serialize_uses_wire_keys() {
        let env = Envelope::new(SignalType::Save, "author", data(json!({"id": 1, "revision": 0})))
            .with_key(1)
            .with_target_queue("replica");
        let value: Value = serde_json::from_slice(&env.to_vec().unwrap()).unwrap();

        assert_eq!(value["signal_type"], "SAVE");
        assert_eq!(value["cqrs_id"], "author");
        assert_eq!(value["instance_pk"], 1);
        assert_eq!(value["retries"], 0);
        assert!(value.get("target_queue").is_none());
        assert!(value.get("meta").is_none());
    }

    #[test]
    fn test_parse_minimal_envelope_defaults() {
        let env = Envelope::from_slice(br#"{"signal_type":"SAVE","cqrs_id":"author","instance_data":{"id":1}}"#)
            .unwrap();
        assert_eq!(env.signal_type, SignalType::Save);
        assert_eq!(env.entity_type, "author");
        assert_eq!(env.instance_key, None);
        assert_eq!(env.previous_data, None);
        assert_eq!(env.correlation_id, None);
        assert_eq!(env.expires_at, None);
        assert_eq!(env.retries, 0);
        assert_eq!(env.target_queue, None);
    }

    #[test]
    fn test_parse_null_retries_is_zero() {
        let env = Envelope::from_slice(
            br#"{"signal_type":"DELETE","cqrs_id":"a","instance_data":{},"retries":null}"#,
        )
        .unwrap();
        assert_eq!(env.retries, 0);
    }

    #[test]
    fn test_parse_full_envelope() {
        let body = json!({
            "signal_type": "SYNC",
            "cqrs_id": "book",
            "instance_data": {"id": "b1", "revision": 4, "updated_at": "2026-01-01T00:00:00Z"},
            "instance_pk": "b1",
            "previous_data": {"title": "old"},
            "correlation_id": "c-1",
            "expires": "2026-01-02T00:00:00Z",
            "retries": 3,
            "meta": {"origin": "test"}
        });
        let env = Envelope::from_slice(body.to_string().as_bytes()).unwrap();
        assert_eq!(env.signal_type, SignalType::Sync);
        assert_eq!(env.instance_key, Some(InstanceKey::from("b1")));
        assert_eq!(env.revision(), Some(4));
        assert!(env.updated_at().is_some());
        assert_eq!(env.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(env.retries, 3);
        assert_eq!(env.meta.unwrap()["origin"], "test");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            Envelope::from_slice(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::from_slice(b"[1,2]"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_missing_signal() {
        assert_eq!(
            Envelope::from_slice(br#"{"cqrs_id":"a"}"#),
            Err(EnvelopeError::MissingField("signal_type"))
        );
    }

    #[test]
    fn test_parse_missing_entity_type() {
        assert_eq!(
            Envelope::from_slice(br#"{"signal_type":"SAVE"}"#),
            Err(EnvelopeError::MissingField("cqrs_id"))
        );
    }

    #[test]
    fn test_parse_unknown_signal() {
        assert_eq!(
            Envelope::from_slice(br#"{"signal_type":"UPSERT","cqrs_id":"a"}"#),
            Err(EnvelopeError::UnknownSignal("UPSERT".into()))
        );
    }

    #[test]
    fn test_revision_and_updated_at_types() {
        let env = Envelope::new(
            SignalType::Save,
            "a",
            data(json!({"revision": "3", "updated_at": 12})),
        );
        assert_eq!(env.revision(), None);
        assert_eq!(env.updated_at(), None);
    }

    #[test]
    fn test_key_or_field_fallback() {
        let env = Envelope::new(SignalType::Delete, "a", data(json!({"id": 9})));
        assert_eq!(env.key_or_field("id"), Some(InstanceKey::Int(9)));
        assert_eq!(env.key_or_field("pk"), None);

        let keyed = env.with_key("explicit");
        assert_eq!(keyed.key_or_field("id"), Some(InstanceKey::from("explicit")));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let env = Envelope::new(SignalType::Save, "a", InstanceData::new());
        assert!(!env.is_expired(now));

        let past = env.clone().with_expires_at(now - ChronoDuration::seconds(1));
        assert!(past.is_expired(now));

        let future = env.with_expires_at(now + ChronoDuration::seconds(60));
        assert!(!future.is_expired(now));
    }
}
