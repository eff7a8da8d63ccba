//! Lifecycle events and their JSON wire format.
//!
//! Wire shape:
//!
//! ```json
//! {"event_type": "agent_started", "event_id": "evt_…", "user_id": "…",
//!  "thread_id": "…", "data": {…}, "timestamp": "2026-01-01T00:00:00Z"}
//! ```
//!
//! Unknown event types decode to [`EventType::Other`] and unknown top-level
//! fields are kept in [`Event::extra`], so a newer producer never breaks an
//! older consumer and re-encoding is lossless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EventId, ThreadId, UserId};

/// Kind of lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// A run has acquired its permit and is starting.
    AgentStarted,
    /// The agent reported intermediate reasoning.
    AgentThinking,
    /// The agent started a tool call.
    ToolExecuting,
    /// A tool call finished.
    ToolCompleted,
    /// A run finished successfully.
    AgentCompleted,
    /// A run failed or timed out.
    AgentError,
    /// Any type this version does not know about.
    Other(String),
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
            Self::AgentError => "agent_error",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "agent_started" => Self::AgentStarted,
            "agent_thinking" => Self::AgentThinking,
            "tool_executing" => Self::ToolExecuting,
            "tool_completed" => Self::ToolCompleted,
            "agent_completed" => Self::AgentCompleted,
            "agent_error" => Self::AgentError,
            _ => Self::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Other(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable lifecycle notification addressed to one user's thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    event_id: EventId,
    user_id: UserId,
    thread_id: ThreadId,
    #[serde(default = "empty_object")]
    data: Value,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Event {
    /// Build a new event stamped with a fresh id and the current time.
    ///
    /// Non-object payloads are wrapped as `{"value": …}` so `data` is always
    /// an object on the wire.
    pub fn new(event_type: EventType, user_id: UserId, thread_id: ThreadId, data: Value) -> Self {
        let data = match data {
            Value::Object(_) => data,
            Value::Null => empty_object(),
            other => serde_json::json!({ "value": other }),
        };
        Self {
            event_type,
            event_id: EventId::new(),
            user_id,
            thread_id,
            data,
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Event kind.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Unique event id.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Thread the event belongs to.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Payload object.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Unknown top-level fields carried over from a decoded payload.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Encode to the JSON wire format.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON wire format.
    pub fn from_wire(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(event_type: EventType, data: Value) -> Event {
        Event::new(event_type, UserId::from_raw("u1"), ThreadId::from_raw("t1"), data)
    }

    #[test]
    fn wire_roundtrip_keeps_identity_fields() {
        let event = sample(EventType::ToolExecuting, json!({"tool": "search"}));
        let decoded = Event::from_wire(&event.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.event_type(), event.event_type());
        assert_eq!(decoded.event_id(), event.event_id());
        assert_eq!(decoded.thread_id(), event.thread_id());
        assert_eq!(decoded, event);
    }

    #[test]
    fn wire_field_names() {
        let event = sample(EventType::AgentStarted, json!({"agent": "a"}));
        let value: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(value["event_type"], "agent_started");
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["thread_id"], "t1");
        assert_eq!(value["data"]["agent"], "a");
        assert!(value["event_id"].as_str().unwrap().starts_with("evt_"));
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "not ISO-8601: {ts}");
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let raw = r#"{
            "event_type": "agent_thinking",
            "event_id": "evt_1",
            "user_id": "u1",
            "thread_id": "t1",
            "data": {"text": "hmm"},
            "timestamp": "2026-01-01T00:00:00Z",
            "trace": {"span": 7}
        }"#;
        let event = Event::from_wire(raw).unwrap();
        assert_eq!(event.extra()["trace"]["span"], 7);
        let reencoded: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(reencoded["trace"]["span"], 7);
    }

    #[test]
    fn unknown_event_type_roundtrips() {
        let raw = r#"{"event_type":"agent_paused","event_id":"evt_2","user_id":"u","thread_id":"t","data":{},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let event = Event::from_wire(raw).unwrap();
        assert_eq!(event.event_type(), &EventType::Other("agent_paused".into()));
        assert!(event.to_wire().unwrap().contains(r#""event_type":"agent_paused""#));
    }

    #[test]
    fn all_json_value_kinds_roundtrip() {
        let data = json!({
            "null": null,
            "bool": true,
            "int": -42,
            "float": 1.5,
            "string": "s",
            "array": [1, "two", {"three": 3}],
            "nested": {"deep": {"deeper": [null]}}
        });
        let event = sample(EventType::AgentCompleted, data.clone());
        let decoded = Event::from_wire(&event.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.data(), &data);
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let event = sample(EventType::AgentThinking, json!("pondering"));
        assert_eq!(event.data(), &json!({"value": "pondering"}));
        let empty = sample(EventType::AgentThinking, Value::Null);
        assert_eq!(empty.data(), &json!({}));
    }

    #[test]
    fn missing_data_defaults_to_empty_object() {
        let raw = r#"{"event_type":"agent_started","event_id":"evt_3","user_id":"u","thread_id":"t","timestamp":"2026-01-01T00:00:00Z"}"#;
        let event = Event::from_wire(raw).unwrap();
        assert_eq!(event.data(), &json!({}));
    }

    #[test]
    fn event_type_names() {
        for (t, name) in [
            (EventType::AgentStarted, "agent_started"),
            (EventType::AgentThinking, "agent_thinking"),
            (EventType::ToolExecuting, "tool_executing"),
            (EventType::ToolCompleted, "tool_completed"),
            (EventType::AgentCompleted, "agent_completed"),
            (EventType::AgentError, "agent_error"),
        ] {
            assert_eq!(t.to_string(), name);
            assert_eq!(EventType::from(name.to_owned()), t);
        }
    }
}
